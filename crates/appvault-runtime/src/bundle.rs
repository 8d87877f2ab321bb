//! Lookup of installed application bundles by identifier.

use std::path::{Path, PathBuf};

use appvault_common::types::ContainerKey;
use appvault_core::plist;
use appvault_core::process::{CommandRunner, CommandSpec};

/// Reads `CFBundleIdentifier` from a bundle's `Info.plist`.
///
/// XML property lists are parsed directly; binary ones are read through the
/// preferences utility at `defaults`.
pub async fn bundle_identifier(
    runner: &dyn CommandRunner,
    defaults: &Path,
    bundle: &Path,
) -> Option<String> {
    let info = bundle.join("Info.plist");
    let bytes = std::fs::read(&info).ok()?;
    if let Some(id) = std::str::from_utf8(&bytes)
        .ok()
        .and_then(|text| plist::parse(text).ok())
        .and_then(|p| p.str_field("CFBundleIdentifier").map(String::from))
    {
        return Some(id);
    }
    let spec = CommandSpec::new(defaults)
        .arg("read")
        .path_arg(&info.with_extension(""))
        .arg("CFBundleIdentifier");
    let out = runner.run(&spec).await.ok()?;
    let id = out.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Finds the `*.app` bundle in `applications_dir` whose identifier is `key`.
pub async fn find_installed_bundle(
    runner: &dyn CommandRunner,
    defaults: &Path,
    applications_dir: &Path,
    key: &ContainerKey,
) -> Option<PathBuf> {
    let mut bundles: Vec<PathBuf> = std::fs::read_dir(applications_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "app"))
        .collect();
    bundles.sort();
    for bundle in bundles {
        if bundle_identifier(runner, defaults, &bundle).await.as_deref() == Some(key.as_str()) {
            return Some(bundle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use appvault_core::testing::{PlistEntry, Reply, ScriptedRunner, info_plist};

    #[tokio::test]
    async fn finds_bundle_by_identifier() {
        let dir = tempfile::tempdir().unwrap();
        for (name, id) in [("Other.app", "com.other"), ("Game.app", "com.example.game")] {
            let bundle = dir.path().join(name);
            std::fs::create_dir_all(&bundle).unwrap();
            std::fs::write(
                bundle.join("Info.plist"),
                info_plist(&[("CFBundleIdentifier", PlistEntry::Str(id))]),
            )
            .unwrap();
        }
        let runner = ScriptedRunner::new();
        let key = ContainerKey::new("com.example.game").unwrap();
        let found = find_installed_bundle(&runner, Path::new("defaults"), dir.path(), &key).await;
        assert_eq!(found, Some(dir.path().join("Game.app")));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn binary_info_plist_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Game.app");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("Info.plist"), b"bplist00\xd1\x01\x02").unwrap();
        let runner = ScriptedRunner::new();
        let _ = runner.on("CFBundleIdentifier", Reply::ok("com.example.game\n"));
        let id = bundle_identifier(&runner, Path::new("defaults"), &bundle).await;
        assert_eq!(id.as_deref(), Some("com.example.game"));
        assert!(runner.calls()[0].starts_with("defaults read "));
        assert!(runner.calls()[0].ends_with("Game.app/Info CFBundleIdentifier"));
    }

    #[tokio::test]
    async fn missing_directory_finds_nothing() {
        let runner = ScriptedRunner::new();
        let key = ContainerKey::new("com.x").unwrap();
        assert_eq!(
            find_installed_bundle(&runner, Path::new("defaults"), Path::new("/no/such/dir"), &key)
                .await,
            None
        );
    }
}
