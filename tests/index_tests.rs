// Integration tests for the signed, cache-backed API index
//
// Manifests are signed with the fixture key in tests/fixtures and served by
// an in-process downloader; single-entity lookups go through a local mockito
// server. Nothing here touches the network.


use anyhow::Result;
use pourover::cache;
use pourover::{ApiClient, IndexKind, PourError, RemoteIndex};
use serde_json::{Value, json};
use std::sync::Arc;
use test_helpers::*;

const FORMULA_ENDPOINT: &str = "formula.jws.json";

fn formula_manifest() -> Value {
    json!([
        {
            "name": "foo",
            "desc": "Foo utilities",
            "aliases": ["f", "foo-tools"],
            "oldnames": ["oldfoo"],
            "versions": { "stable": "1.2.3" }
        },
        { "name": "bar", "oldname": "baz", "versions": { "stable": "0.1" } },
        { "desc": "an entry without a name is ignored", "aliases": ["ghost"] }
    ])
}

fn client(env: &TestEnvironment, fake: &Arc<FakeDownloader>, extra: &[(&str, &str)]) -> Result<ApiClient> {
    Ok(ApiClient::with_downloader(env.config_with(extra), fake.clone())?)
}

#[tokio::test]
async fn test_update_builds_consistent_maps_and_name_files() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());

    let index = RemoteIndex::new(client(&env, &fake, &[])?, IndexKind::Formula);
    let snapshot = index.update().await?;

    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.aliases.len(), 2);
    assert_eq!(snapshot.aliases["f"], "foo");
    assert_eq!(snapshot.renames["oldfoo"], "foo");
    assert_eq!(snapshot.renames["baz"], "bar");
    for target in snapshot.aliases.values().chain(snapshot.renames.values()) {
        assert!(snapshot.entries.contains_key(target), "{target} has no entry");
    }
    assert!(snapshot.entries["foo"].get("name").is_none());

    let api_dir = env.config().api_cache();
    assert_eq!(
        cache::read_names_file(&api_dir.join("formula_names.txt")),
        Some(vec!["bar".to_string(), "foo".to_string()])
    );
    let aliases = cache::read_pairs_file(&api_dir.join("formula_aliases.txt")).unwrap();
    assert_eq!(aliases.get("foo-tools").map(String::as_str), Some("foo"));
    let renames = cache::read_pairs_file(&api_dir.join("formula_renames.txt")).unwrap();
    assert_eq!(renames.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_resolve_and_get() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());
    let index = RemoteIndex::new(client(&env, &fake, &[])?, IndexKind::Formula);

    assert_eq!(index.resolve("foo").await?, "foo");
    assert_eq!(index.resolve("f").await?, "foo");
    assert_eq!(index.resolve("oldfoo").await?, "foo");

    let (name, entry) = index.get("foo-tools").await?;
    assert_eq!(name, "foo");
    assert_eq!(entry["desc"], "Foo utilities");

    match index.resolve("fooo").await {
        Err(PourError::NotFound {
            kind, suggestions, ..
        }) => {
            assert_eq!(kind, "Formula");
            assert_eq!(suggestions, vec!["foo".to_string()]);
        }
        other => panic!("expected NotFound, got {other:?}"),
    }

    // One fetch serves every query in the process
    assert_eq!(fake.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_fresh_cache_skips_download() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());

    let api = client(&env, &fake, &[])?;
    let (_, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert!(updated);
    assert_eq!(fake.request_count(), 1);

    // Cached copy is younger than the auto-update interval
    let (manifest, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert!(!updated);
    assert_eq!(manifest, formula_manifest());
    assert_eq!(fake.request_count(), 1);

    // Stale copy is downloaded again; identical content is not an update
    let api = client(&env, &fake, &[("HOMEBREW_API_AUTO_UPDATE_SECS", "0")])?;
    let (_, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert!(!updated);
    assert_eq!(fake.request_count(), 2);

    let mut changed = formula_manifest();
    changed.as_array_mut().unwrap().push(json!({ "name": "qux" }));
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&changed).to_string());
    let (manifest, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert!(updated);
    assert_eq!(manifest.as_array().map(Vec::len), Some(4));
    Ok(())
}

#[tokio::test]
async fn test_no_auto_update_never_downloads_over_cache() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());
    client(&env, &fake, &[])?
        .fetch_json_api_file(FORMULA_ENDPOINT)
        .await?;

    let api = client(
        &env,
        &fake,
        &[("HOMEBREW_API_AUTO_UPDATE_SECS", "0"), ("HOMEBREW_NO_AUTO_UPDATE", "1")],
    )?;
    api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert_eq!(fake.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_bad_signature_leaves_cache_untouched() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());
    let index = RemoteIndex::new(client(&env, &fake, &[])?, IndexKind::Formula);
    index.update().await?;

    let api_dir = env.config().api_cache();
    let cached = std::fs::read(api_dir.join(FORMULA_ENDPOINT))?;
    let names = std::fs::read(api_dir.join("formula_names.txt"))?;

    let mut tampered = sign_manifest(&formula_manifest());
    tampered["payload"] = Value::String(json!([{ "name": "evil" }]).to_string());
    fake.serve(FORMULA_ENDPOINT, tampered.to_string());

    let stale = RemoteIndex::new(
        client(&env, &fake, &[("HOMEBREW_API_AUTO_UPDATE_SECS", "0")])?,
        IndexKind::Formula,
    );
    let err = stale.update().await.unwrap_err();
    assert!(matches!(err, PourError::Signature { .. }), "got {err:?}");
    assert!(!err.is_retryable());

    assert_eq!(std::fs::read(api_dir.join(FORMULA_ENDPOINT))?, cached);
    assert_eq!(std::fs::read(api_dir.join("formula_names.txt"))?, names);
    for entry in std::fs::read_dir(&api_dir)? {
        let name = entry?.file_name();
        assert!(!name.to_string_lossy().starts_with(".download"), "leftover {name:?}");
    }

    // The earlier snapshot is still what a fresh process sees
    let fresh = RemoteIndex::new(client(&env, &fake, &[])?, IndexKind::Formula);
    assert_eq!(fresh.resolve("f").await?, "foo");
    Ok(())
}

#[tokio::test]
async fn test_unknown_key_id_is_rejected() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    let mut envelope = sign_manifest(&formula_manifest());
    envelope["signatures"][0]["header"]["kid"] = json!("homebrew-2");
    fake.serve(FORMULA_ENDPOINT, envelope.to_string());

    let api = client(&env, &fake, &[])?;
    let err = api.fetch_json_api_file(FORMULA_ENDPOINT).await.unwrap_err();
    assert!(matches!(err, PourError::Signature { .. }), "got {err:?}");
    assert!(!cache::is_present(&env.config().api_cache().join(FORMULA_ENDPOINT)));
    Ok(())
}

#[tokio::test]
async fn test_failed_download_falls_back_to_cache() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());
    client(&env, &fake, &[])?
        .fetch_json_api_file(FORMULA_ENDPOINT)
        .await?;

    fake.fail(FORMULA_ENDPOINT);
    let api = client(&env, &fake, &[("HOMEBREW_API_AUTO_UPDATE_SECS", "0")])?;
    let (manifest, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert_eq!(manifest, formula_manifest());
    assert!(!updated);
    Ok(())
}

#[tokio::test]
async fn test_failed_download_without_cache_is_retryable() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());

    let err = client(&env, &fake, &[])?
        .fetch_json_api_file(FORMULA_ENDPOINT)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_corrupt_cache_is_downloaded_again() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());

    let api_dir = env.config().api_cache();
    std::fs::create_dir_all(&api_dir)?;
    std::fs::write(api_dir.join(FORMULA_ENDPOINT), "{ truncated")?;

    let (manifest, _) = client(&env, &fake, &[])?
        .fetch_json_api_file(FORMULA_ENDPOINT)
        .await?;
    assert_eq!(manifest, formula_manifest());
    assert_eq!(fake.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unverifiable_cache_is_downloaded_again() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    fake.serve(FORMULA_ENDPOINT, sign_manifest(&formula_manifest()).to_string());

    // Parses as JSON but is no signed envelope.
    let api_dir = env.config().api_cache();
    std::fs::create_dir_all(&api_dir)?;
    std::fs::write(api_dir.join(FORMULA_ENDPOINT), r#"[{"name":"evil"}]"#)?;

    let api = client(&env, &fake, &[("HOMEBREW_NO_AUTO_UPDATE", "1")])?;
    let (manifest, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert_eq!(manifest, formula_manifest());
    assert!(updated);
    assert_eq!(fake.request_count(), 1);

    // The replacement verifies, so the next call stays offline.
    let (again, updated) = api.fetch_json_api_file(FORMULA_ENDPOINT).await?;
    assert_eq!(again, formula_manifest());
    assert!(!updated);
    assert_eq!(fake.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_refreshes_cache_verified_bytes() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    let signed = sign_manifest(&formula_manifest()).to_string();
    fake.serve(FORMULA_ENDPOINT, signed.clone());

    let extra = [("HOMEBREW_API_AUTO_UPDATE_SECS", "0")];
    let first = client(&env, &fake, &extra)?;
    let second = client(&env, &fake, &extra)?;
    let (a, b) = tokio::join!(
        first.fetch_json_api_file(FORMULA_ENDPOINT),
        second.fetch_json_api_file(FORMULA_ENDPOINT)
    );
    assert_eq!(a?.0, formula_manifest());
    assert_eq!(b?.0, formula_manifest());
    assert_eq!(fake.request_count(), 2);

    let api_dir = env.config().api_cache();
    assert_eq!(std::fs::read_to_string(api_dir.join(FORMULA_ENDPOINT))?, signed);
    assert!(env.config().lock_dir().join("api-formula.lock").exists());
    Ok(())
}

#[tokio::test]
async fn test_cask_index_uses_tokens() -> Result<()> {
    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    let manifest = json!([
        { "token": "firefox", "old_tokens": ["firefox-esr-old"], "version": "131.0" },
        { "token": "iterm2" }
    ]);
    fake.serve("cask.jws.json", sign_manifest(&manifest).to_string());

    let index = RemoteIndex::new(client(&env, &fake, &[])?, IndexKind::Cask);
    let (token, entry) = index.get("firefox-esr-old").await?;
    assert_eq!(token, "firefox");
    assert_eq!(entry["version"], "131.0");
    assert!(index.all_aliases().await?.is_empty());

    let api_dir = env.config().api_cache();
    assert_eq!(
        cache::read_names_file(&api_dir.join("cask_names.txt")),
        Some(vec!["firefox".to_string(), "iterm2".to_string()])
    );
    assert!(api_dir.join("cask_renames.txt").exists());
    assert!(!api_dir.join("formula_aliases.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_fetch_formula_from_api() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let found = server
        .mock("GET", "/formula/jq.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "name": "jq",
                "full_name": "jq",
                "versions": { "stable": "1.7.1", "bottle": true },
                "revision": 1,
                "dependencies": ["oniguruma"]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let missing = server
        .mock("GET", "/formula/nope.json")
        .with_status(404)
        .create_async()
        .await;

    let env = TestEnvironment::new();
    let fake = Arc::new(FakeDownloader::new());
    let api = client(&env, &fake, &[("HOMEBREW_API_DOMAIN", server.url().as_str())])?;

    let formula = api.fetch_formula("jq").await?;
    assert_eq!(formula.pkg_version().as_deref(), Some("1.7.1_1"));
    assert_eq!(formula.dependencies, vec!["oniguruma"]);
    // Second lookup is served from memory
    api.fetch_formula("jq").await?;
    found.assert_async().await;

    let err = api.fetch_formula("nope").await.unwrap_err();
    assert!(matches!(err, PourError::NotFound { kind: "Formula", .. }), "got {err:?}");
    missing.assert_async().await;
    Ok(())
}
