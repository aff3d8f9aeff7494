//! Shared-package dependency resolution.
//!
//! Plugins reference shared UI libraries through the `node_modules/{name}/`
//! path convention in their `index.html`. The resolver scans the entry
//! point, looks each name up in the read-only shared package store, and
//! aliases the installed package into the plugin's working directory so the
//! script tags resolve. Resolution is split into a pure planning step and a
//! side-effecting apply step, so "what to fix" is unit-testable without
//! touching disk.
//!
//! Some packages additionally need a structural fixup: their install does
//! not actually contain the conventional dist file plugins reference. The
//! fixup synthesizes that path from a known-good CDN asset, or writes a
//! diagnostic stub when the download is unavailable. Fixups are idempotent
//! and individually best-effort: a failure is a warning, never fatal.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Dependency set assumed when the entry point is missing or references
/// nothing detectable. Plugins are expected to work even with imprecise
/// detection, so this errs toward the common UI libraries.
pub const DEFAULT_PACKAGES: &[&str] = &["jquery", "bootstrap"];

/// Conventional dist paths that installed packages are known to lack,
/// with a CDN source for a known-good replacement.
struct Fixup {
    package: &'static str,
    rel_path: &'static str,
    cdn_url: &'static str,
    kind: FixupKind,
}

enum FixupKind {
    Script,
    Stylesheet,
}

const FIXUPS: &[Fixup] = &[
    Fixup {
        package: "jquery",
        rel_path: "dist/jquery.min.js",
        cdn_url: "https://cdn.jsdelivr.net/npm/jquery@3/dist/jquery.min.js",
        kind: FixupKind::Script,
    },
    Fixup {
        package: "bootstrap",
        rel_path: "dist/js/bootstrap.bundle.min.js",
        cdn_url: "https://cdn.jsdelivr.net/npm/bootstrap@5/dist/js/bootstrap.bundle.min.js",
        kind: FixupKind::Script,
    },
    Fixup {
        package: "bootstrap",
        rel_path: "dist/css/bootstrap.min.css",
        cdn_url: "https://cdn.jsdelivr.net/npm/bootstrap@5/dist/css/bootstrap.min.css",
        kind: FixupKind::Stylesheet,
    },
];

fn has_fixups(package: &str) -> bool {
    FIXUPS.iter().any(|f| f.package == package)
}

// ---------------------------------------------------------------------------
// Shared package store
// ---------------------------------------------------------------------------

/// Read-only, on-disk store of shared packages: `{root}/{name}@{version}/`.
/// The resolver only searches it and links/copies out of it.
pub struct SharedPackageStore {
    root: PathBuf,
}

impl SharedPackageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate an installed version of `name`, preferring the highest
    /// version directory when several are installed.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let prefix = format!("{name}@");
        let entries = std::fs::read_dir(&self.root).ok()?;
        let mut candidates: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.starts_with(&prefix))
            .collect();
        candidates.sort();
        candidates.pop().map(|dir| self.root.join(dir))
    }
}

// ---------------------------------------------------------------------------
// Detection (pure)
// ---------------------------------------------------------------------------

fn script_src_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Matches <script src="[./]node_modules/{name}/..."> including
        // scoped names like @org/widget.
        Regex::new(
            r#"<script[^>]*\bsrc\s*=\s*["'](?:\./)?node_modules/((?:@[\w.-]+/)?[\w.-]+)/"#,
        )
        .expect("script src regex")
    })
}

/// Package names referenced by the document's script tags, in order of
/// first appearance, deduplicated.
pub fn detect_packages(html: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in script_src_regex().captures_iter(html) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Planning (pure)
// ---------------------------------------------------------------------------

/// How a resolved package is materialized into the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasKind {
    /// Symlink into the shared store (read-only packages).
    Link,
    /// Full copy, used for packages that receive structural fixups, so the
    /// fixup never writes through a symlink into the shared store.
    Copy,
}

#[derive(Debug, Clone)]
pub struct AliasAction {
    pub name: String,
    pub source: PathBuf,
    /// Relative to the working directory.
    pub target: PathBuf,
    pub kind: AliasKind,
}

#[derive(Debug, Default)]
pub struct ResolutionPlan {
    pub aliases: Vec<AliasAction>,
    /// Detected names with no installed version. Logged, never fatal.
    pub unresolved: Vec<String>,
    /// Names whose fixups must run (resolved or not).
    pub fixup_targets: Vec<String>,
}

/// Compute the resolution plan for a document against the store.
/// `html` is `None` when the plugin ships no entry point; detection then
/// falls back to [`DEFAULT_PACKAGES`].
pub fn plan(html: Option<&str>, store: &SharedPackageStore) -> ResolutionPlan {
    let detected = match html {
        Some(doc) => {
            let found = detect_packages(doc);
            if found.is_empty() {
                DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect()
            } else {
                found
            }
        }
        None => DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect(),
    };

    let mut out = ResolutionPlan::default();
    for name in detected {
        if has_fixups(&name) {
            out.fixup_targets.push(name.clone());
        }
        match store.find(&name) {
            Some(source) => {
                let kind = if has_fixups(&name) {
                    AliasKind::Copy
                } else {
                    AliasKind::Link
                };
                out.aliases.push(AliasAction {
                    target: PathBuf::from("public/node_modules").join(&name),
                    name,
                    source,
                    kind,
                });
            }
            None => out.unresolved.push(name),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Apply (side effects)
// ---------------------------------------------------------------------------

/// Execute the plan against a working directory. Returns warnings for
/// actions that failed; never errors as a whole.
pub fn apply_plan(plan: &ResolutionPlan, working_dir: &Path) -> Vec<String> {
    let mut warnings = Vec::new();
    for name in &plan.unresolved {
        warnings.push(format!("no installed version of \"{name}\" in shared store"));
    }
    for action in &plan.aliases {
        let target = working_dir.join(&action.target);
        if target.exists() {
            // Idempotent: a previous apply already materialized it.
            continue;
        }
        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warnings.push(format!("creating alias dir for \"{}\": {e}", action.name));
                continue;
            }
        }
        let result = match action.kind {
            AliasKind::Link => symlink_dir(&action.source, &target),
            AliasKind::Copy => copy_dir_recursive(&action.source, &target),
        };
        if let Err(e) = result {
            warnings.push(format!("aliasing \"{}\": {e}", action.name));
        }
    }
    warnings
}

#[cfg(unix)]
fn symlink_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn symlink_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    // Directory symlinks need privileges on Windows; copy instead.
    copy_dir_recursive(source, target)
}

/// Recursively copy a directory.
fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct Resolver {
    store: SharedPackageStore,
    http: reqwest::Client,
    /// When false, fixups skip the CDN and go straight to the stub.
    cdn_fixups: bool,
}

impl Resolver {
    pub fn new(store: SharedPackageStore, http: reqwest::Client, cdn_fixups: bool) -> Self {
        Self {
            store,
            http,
            cdn_fixups,
        }
    }

    /// Fix up a freshly extracted working directory. Returns the non-fatal
    /// warnings collected along the way.
    pub async fn resolve(&self, working_dir: &Path) -> Vec<String> {
        let html = ["public/index.html", "index.html"]
            .iter()
            .find_map(|p| std::fs::read_to_string(working_dir.join(p)).ok());

        let plan = plan(html.as_deref(), &self.store);
        let mut warnings = apply_plan(&plan, working_dir);
        warnings.extend(self.apply_fixups(working_dir, &plan.fixup_targets).await);
        warnings
    }

    /// Synthesize conventional dist paths for the given packages. No-ops
    /// when the target already exists; each failure becomes a warning.
    pub async fn apply_fixups(&self, working_dir: &Path, packages: &[String]) -> Vec<String> {
        let mut warnings = Vec::new();
        for fixup in FIXUPS {
            if !packages.iter().any(|p| p == fixup.package) {
                continue;
            }
            let target = working_dir
                .join("public/node_modules")
                .join(fixup.package)
                .join(fixup.rel_path);
            if target.exists() {
                continue;
            }
            if let Err(e) = self.write_fixup(fixup, &target).await {
                warnings.push(format!(
                    "fixup {}/{}: {e}",
                    fixup.package, fixup.rel_path
                ));
            }
        }
        warnings
    }

    async fn write_fixup(&self, fixup: &Fixup, target: &Path) -> Result<(), String> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("creating dirs: {e}"))?;
        }

        if self.cdn_fixups {
            match self.fetch_cdn(fixup.cdn_url).await {
                Ok(bytes) => {
                    std::fs::write(target, bytes).map_err(|e| format!("writing asset: {e}"))?;
                    tracing::debug!(url = fixup.cdn_url, "fixup asset downloaded");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        url = fixup.cdn_url,
                        "fixup download failed, writing stub: {e}"
                    );
                }
            }
        }

        let stub = match fixup.kind {
            FixupKind::Script => format!(
                "console.warn(\"[apphost] {}/{} is a stub: the shared package is \
                 incomplete and the CDN asset was unavailable\");\n",
                fixup.package, fixup.rel_path
            ),
            FixupKind::Stylesheet => format!(
                "/* [apphost] {}/{} is a stub: the shared package is incomplete \
                 and the CDN asset was unavailable */\n",
                fixup.package, fixup.rel_path
            ),
        };
        std::fs::write(target, stub).map_err(|e| format!("writing stub: {e}"))
    }

    async fn fetch_cdn(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("CDN returned HTTP {}", resp.status()));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| format!("reading body: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_resolver(store_root: &Path) -> Resolver {
        Resolver::new(
            SharedPackageStore::new(store_root),
            reqwest::Client::new(),
            false,
        )
    }

    // -- Detection --

    #[test]
    fn detects_plain_and_relative_srcs() {
        let html = r#"
            <script src="node_modules/jquery/dist/jquery.min.js"></script>
            <script src="./node_modules/lodash/lodash.min.js"></script>
        "#;
        assert_eq!(detect_packages(html), vec!["jquery", "lodash"]);
    }

    #[test]
    fn detects_scoped_packages() {
        let html = r#"<script src="node_modules/@acme/widgets/dist/w.js"></script>"#;
        assert_eq!(detect_packages(html), vec!["@acme/widgets"]);
    }

    #[test]
    fn deduplicates_repeated_references() {
        let html = r#"
            <script src="node_modules/jquery/dist/jquery.min.js"></script>
            <script src="node_modules/jquery/dist/jquery.slim.js"></script>
        "#;
        assert_eq!(detect_packages(html), vec!["jquery"]);
    }

    #[test]
    fn ignores_non_convention_srcs() {
        let html = r#"
            <script src="script.js"></script>
            <script src="https://cdn.example.com/lib.js"></script>
        "#;
        assert!(detect_packages(html).is_empty());
    }

    // -- Store lookup --

    #[test]
    fn find_prefers_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jquery@3.6.0")).unwrap();
        std::fs::create_dir_all(dir.path().join("jquery@3.7.1")).unwrap();
        let store = SharedPackageStore::new(dir.path());
        let found = store.find("jquery").unwrap();
        assert!(found.ends_with("jquery@3.7.1"));
    }

    #[test]
    fn find_does_not_match_name_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jquery-ui@1.13.0")).unwrap();
        let store = SharedPackageStore::new(dir.path());
        assert!(store.find("jquery").is_none());
    }

    // -- Planning --

    #[test]
    fn plan_falls_back_to_defaults_without_html() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedPackageStore::new(dir.path());
        let p = plan(None, &store);
        // Nothing installed, so everything lands in unresolved, but the
        // fixup targets still cover the defaults.
        assert_eq!(p.unresolved, DEFAULT_PACKAGES);
        assert!(p.fixup_targets.iter().any(|n| n == "jquery"));
    }

    #[test]
    fn plan_falls_back_to_defaults_when_nothing_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedPackageStore::new(dir.path());
        let p = plan(Some("<html><body>hi</body></html>"), &store);
        assert_eq!(p.unresolved, DEFAULT_PACKAGES);
    }

    #[test]
    fn plan_marks_fixup_packages_as_copies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jquery@3.7.1/dist")).unwrap();
        std::fs::create_dir_all(dir.path().join("lodash@4.17.21")).unwrap();
        let store = SharedPackageStore::new(dir.path());

        let html = r#"
            <script src="node_modules/jquery/dist/jquery.min.js"></script>
            <script src="node_modules/lodash/lodash.min.js"></script>
        "#;
        let p = plan(Some(html), &store);
        let jquery = p.aliases.iter().find(|a| a.name == "jquery").unwrap();
        let lodash = p.aliases.iter().find(|a| a.name == "lodash").unwrap();
        assert_eq!(jquery.kind, AliasKind::Copy);
        assert_eq!(lodash.kind, AliasKind::Link);
        assert_eq!(
            jquery.target,
            PathBuf::from("public/node_modules/jquery")
        );
    }

    // -- Apply --

    #[test]
    fn apply_links_and_is_idempotent() {
        let store_dir = tempfile::tempdir().unwrap();
        let pkg = store_dir.path().join("lodash@4.17.21");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("lodash.min.js"), "x").unwrap();
        let store = SharedPackageStore::new(store_dir.path());

        let work = tempfile::tempdir().unwrap();
        let html = r#"<script src="node_modules/lodash/lodash.min.js"></script>"#;
        let p = plan(Some(html), &store);

        let w1 = apply_plan(&p, work.path());
        assert!(w1.is_empty(), "unexpected warnings: {w1:?}");
        let alias = work.path().join("public/node_modules/lodash/lodash.min.js");
        assert!(alias.exists());

        // Second apply: no duplicate links, no errors.
        let w2 = apply_plan(&p, work.path());
        assert!(w2.is_empty(), "second apply warned: {w2:?}");
        assert!(alias.exists());
    }

    #[test]
    fn apply_reports_unresolved_as_warnings() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = SharedPackageStore::new(store_dir.path());
        let work = tempfile::tempdir().unwrap();
        let html = r#"<script src="node_modules/ghost-lib/g.js"></script>"#;
        let p = plan(Some(html), &store);
        let warnings = apply_plan(&p, work.path());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ghost-lib"));
    }

    // -- Fixups --

    #[tokio::test]
    async fn fixup_writes_stub_offline_and_is_idempotent() {
        let store_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let resolver = offline_resolver(store_dir.path());

        let warnings = resolver
            .apply_fixups(work.path(), &["jquery".to_string()])
            .await;
        assert!(warnings.is_empty(), "{warnings:?}");

        let target = work
            .path()
            .join("public/node_modules/jquery/dist/jquery.min.js");
        let stub = std::fs::read_to_string(&target).unwrap();
        assert!(stub.contains("stub"));

        // Re-running must not rewrite the file.
        std::fs::write(&target, "real contents").unwrap();
        let w2 = resolver
            .apply_fixups(work.path(), &["jquery".to_string()])
            .await;
        assert!(w2.is_empty());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "real contents");
    }

    #[tokio::test]
    async fn fixup_skips_packages_without_entries() {
        let store_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let resolver = offline_resolver(store_dir.path());
        let warnings = resolver
            .apply_fixups(work.path(), &["lodash".to_string()])
            .await;
        assert!(warnings.is_empty());
        assert!(!work.path().join("public/node_modules/lodash").exists());
    }

    // -- End to end over a working dir --

    #[tokio::test]
    async fn resolve_makes_convention_paths_reachable() {
        let store_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(work.path().join("public")).unwrap();
        std::fs::write(
            work.path().join("public/index.html"),
            r#"<html><head>
                <script src="node_modules/jquery/dist/jquery.min.js"></script>
            </head></html>"#,
        )
        .unwrap();

        let resolver = offline_resolver(store_dir.path());
        let warnings = resolver.resolve(work.path()).await;
        // jquery is not installed in the (empty) store: warned, not fatal.
        assert!(warnings.iter().any(|w| w.contains("jquery")));
        // But the conventional path is reachable via the stub fixup.
        assert!(
            work.path()
                .join("public/node_modules/jquery/dist/jquery.min.js")
                .is_file()
        );
    }
}
