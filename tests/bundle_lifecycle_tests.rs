//! Freeze, export, import and tamper detection of complete bundles

use reprobundle::{
    export, export_to_dir, export_to_path, import, import_from_dir, import_from_path, BundleFormat,
    Compression, ReproError,
};
use std::fs;
use std::io::{Cursor, Read, Write};
use tempfile::TempDir;

mod utils;

#[test]
fn test_failed_capture_is_recorded_and_bundle_still_exports() {
    let bundle = utils::frozen_bundle();

    assert!(!bundle.module_states().contains_key("effect_sizes"));
    assert!(bundle.module_states().contains_key("t_test"));
    assert_eq!(bundle.capture_errors().len(), 1);
    assert_eq!(bundle.capture_errors()[0].module, "effect_sizes");

    let bytes = export(&bundle, BundleFormat::Zip, Compression::Deflate).unwrap();
    let loaded = import(&bytes).unwrap();
    assert_eq!(loaded.capture_errors(), bundle.capture_errors());
}

#[test]
fn test_round_trip_every_format() {
    let bundle = utils::frozen_bundle();
    let cases = [
        (BundleFormat::Json, Compression::None),
        (BundleFormat::MessagePack, Compression::None),
        (BundleFormat::Zip, Compression::None),
        (BundleFormat::Zip, Compression::Deflate),
    ];
    for (format, compression) in cases {
        let loaded = import(&export(&bundle, format, compression).unwrap()).unwrap();
        assert_eq!(
            loaded.recompute_checksum().unwrap(),
            bundle.checksum(),
            "{:?}/{:?}",
            format,
            compression
        );
        assert_eq!(loaded, bundle);
    }
}

#[test]
fn test_bundle_content_survives_round_trip() {
    let bundle = utils::frozen_bundle();
    let loaded = import(&export(&bundle, BundleFormat::Zip, Compression::None).unwrap()).unwrap();

    assert_eq!(loaded.id(), bundle.id());
    assert_eq!(loaded.creator(), "integration");
    assert_eq!(loaded.steps().len(), 2);
    assert_eq!(loaded.decisions().len(), 1);
    assert_eq!(loaded.seeds().master_seed, utils::MASTER_SEED);
    assert!(loaded.seeds().derived.contains_key("bootstrap"));
    assert_eq!(loaded.result("estimator"), bundle.result("estimator"));
    assert!(loaded.methods_text().contains("residuals look normal"));
    assert_eq!(
        loaded.last_inputs_for("shapiro"),
        Some(&serde_json::json!({"alpha": 0.05, "column": "score"}))
    );
}

/// Rewrite one entry of a zip archive, leaving the others untouched
fn rewrite_zip_entry(bytes: &[u8], target: &str, edit: impl Fn(&mut Vec<u8>)) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let name = entry.name().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        if name == target {
            edit(&mut content);
        }
        writer
            .start_file(name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(&content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[test]
fn test_flipped_byte_in_fingerprints_is_corrupt() {
    let bundle = utils::frozen_bundle();
    let bytes = export(&bundle, BundleFormat::Zip, Compression::Deflate).unwrap();

    let tampered = rewrite_zip_entry(&bytes, "fingerprints.json", |content| {
        let last = content.len() / 2;
        content[last] ^= 0x01;
    });
    let err = import(&tampered).unwrap_err();
    assert!(matches!(err, ReproError::CorruptBundle(_)), "{:?}", err);
}

#[test]
fn test_consistent_manifest_forgery_is_still_caught() {
    // Re-signing the file digest is not enough: the bundle checksum covers content too.
    let bundle = utils::frozen_bundle();
    let bytes = export(&bundle, BundleFormat::Zip, Compression::None).unwrap();

    let forged_results = br#"{"t":9.99,"df":2,"significant":true}"#.to_vec();
    let digest = reprobundle::canonical::sha256_hex(&forged_results);
    let tampered = rewrite_zip_entry(&bytes, "results/t_test.json", |content| {
        *content = forged_results.clone();
    });
    let tampered = rewrite_zip_entry(&tampered, "manifest.json", |content| {
        let mut manifest: serde_json::Value = serde_json::from_slice(content).unwrap();
        manifest["files"]["results/t_test.json"] = serde_json::Value::String(digest.clone());
        *content = serde_json::to_vec(&manifest).unwrap();
    });

    let err = import(&tampered).unwrap_err();
    match err {
        ReproError::CorruptBundle(detail) => assert!(detail.contains("checksum"), "{}", detail),
        other => panic!("expected CorruptBundle, got {:?}", other),
    }
}

#[test]
fn test_envelope_with_traversal_module_name_is_refused() {
    // The checksum is recomputed after the edit, so only name checks can catch it.
    let bundle = utils::frozen_bundle();
    let bytes = export(&bundle, BundleFormat::Json, Compression::None).unwrap();
    let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    let results = envelope["bundle"]["results"].as_object_mut().unwrap();
    let stored = results.remove("estimator").unwrap();
    results.insert("../../escaped".to_string(), stored);
    let checksum = reprobundle::canonical::canonical_digest(&envelope["bundle"]).unwrap();
    envelope["checksum"] = serde_json::Value::String(checksum);

    let err = import(&serde_json::to_vec(&envelope).unwrap()).unwrap_err();
    assert!(matches!(err, ReproError::CorruptBundle(_)), "{:?}", err);
}

#[test]
fn test_directory_tamper_detected() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("bundle");
    let bundle = utils::frozen_bundle();
    export_to_dir(&bundle, &dir).unwrap();
    assert_eq!(import_from_dir(&dir).unwrap(), bundle);

    let path = dir.join("fingerprints.json");
    let mut content = fs::read(&path).unwrap();
    content[10] ^= 0x20;
    fs::write(&path, content).unwrap();
    assert!(matches!(
        import_from_dir(&dir),
        Err(ReproError::CorruptBundle(_))
    ));
}

#[test]
fn test_directory_extra_and_missing_files_detected() {
    let temp = TempDir::new().unwrap();
    let bundle = utils::frozen_bundle();

    let extra = temp.path().join("extra");
    export_to_dir(&bundle, &extra).unwrap();
    fs::write(extra.join("results").join("injected.json"), b"1").unwrap();
    assert!(matches!(
        import_from_path(&extra),
        Err(ReproError::CorruptBundle(_))
    ));

    let missing = temp.path().join("missing");
    export_to_dir(&bundle, &missing).unwrap();
    fs::remove_file(missing.join("seeds.json")).unwrap();
    assert!(matches!(
        import_from_path(&missing),
        Err(ReproError::CorruptBundle(_))
    ));
}

#[test]
fn test_export_to_path_replaces_existing_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("analysis.bundle");
    fs::write(&path, b"stale").unwrap();

    let bundle = utils::frozen_bundle();
    export_to_path(&bundle, &path, BundleFormat::MessagePack, Compression::None).unwrap();
    assert_eq!(import_from_path(&path).unwrap(), bundle);
}

#[test]
fn test_freeze_twice_exports_identical_bytes() {
    let session = utils::recorded_session(3.14159265358979);
    let first = export(&session.freeze().unwrap(), BundleFormat::Json, Compression::None).unwrap();
    let second = export(&session.freeze().unwrap(), BundleFormat::Json, Compression::None).unwrap();
    assert_eq!(first, second);
}
