use super::*;

fn sample() -> StoredCredentials {
    StoredCredentials {
        email: "tollgate-server-0011223344556677@tollgate.local".into(),
        password: "x".repeat(64),
        user_id: None,
        created_at: Utc::now(),
    }
}

#[test]
fn generators_produce_expected_shapes() {
    let id = generate_local_id().unwrap();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    let pw = generate_password().unwrap();
    assert_eq!(pw.len(), 64);
    assert_ne!(pw, generate_password().unwrap());
    let creds = StoredCredentials::generate().unwrap();
    assert!(creds.email.starts_with(GENERATED_EMAIL_PREFIX));
    assert!(creds.email.ends_with("@tollgate.local"));
}

#[test]
fn save_then_load_with_owner_only_permissions() {
    let tmp = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(tmp.path().join("nested").join("credentials.json"));
    assert!(!store.has());
    assert!(store.load().is_none());
    let mut creds = sample();
    creds.user_id = Some("user-1".into());
    store.save(&creds).unwrap();
    assert!(store.has());
    assert_eq!(store.load().unwrap(), creds);

    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
    assert_eq!(raw["userId"], "user-1");
    assert!(raw.get("createdAt").is_some());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    // No temp file left behind.
    let entries: Vec<_> = std::fs::read_dir(store.path().parent().unwrap()).unwrap().flatten().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn load_tolerates_incomplete_or_garbage_files() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let store = CredentialStore::new(&path);

    std::fs::write(&path, br#"{"email":"a@b.c","createdAt":"2024-01-01T00:00:00Z"}"#).unwrap();
    assert!(store.load().is_none());

    std::fs::write(&path, br#"{"email":"","password":"p","createdAt":"2024-01-01T00:00:00Z"}"#).unwrap();
    assert!(store.load().is_none());

    std::fs::write(&path, b"not json").unwrap();
    assert!(store.load().is_none());
}

#[test]
fn delete_is_best_effort() {
    let tmp = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(tmp.path().join("credentials.json"));
    store.delete();
    store.save(&sample()).unwrap();
    store.delete();
    assert!(!store.has());
    store.delete();
}

#[test]
fn save_fails_loudly_when_parent_is_a_file() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let store = CredentialStore::new(blocker.join("credentials.json"));
    assert!(matches!(store.save(&sample()), Err(CredentialError::Io { .. })));
}
