//! Bundle export and import
//!
//! Three encodings share one integrity model:
//!
//! | Format        | Layout                                   | Compression      |
//! |---------------|------------------------------------------|------------------|
//! | `Json`        | single canonical-JSON envelope           | none             |
//! | `MessagePack` | single MessagePack envelope              | none             |
//! | `Zip`         | multi-file container (see below)         | none or deflate  |
//!
//! The container (zip archive or directory) holds:
//!
//! ```text
//! manifest.json            schema_version, checksum, created_at, bundle_id, files{path: sha256}
//! bundle.json              id, created_at, creator, description
//! fingerprints.json
//! pipeline.json            steps + decisions
//! seeds.json
//! environment.json
//! capture_errors.json
//! methods.md
//! module_states/<name>.json
//! results/<name>.json
//! ```
//!
//! Import never trusts the input: every file digest is checked against the
//! manifest, unexpected or missing files are rejected, and the bundle
//! checksum is recomputed before a [`Bundle`] is handed out. All of these
//! failures are `CorruptBundle`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::bundle::{Bundle, BundleBody};
use crate::cancel::CancellationToken;
use crate::canonical::{canonical_bytes, sha256_hex};
use crate::environment::EnvironmentInfo;
use crate::error::{ReproError, Result};
use crate::fingerprint::Fingerprint;
use crate::names::validate_name;
use crate::pipeline::PipelineLog;
use crate::seed::SeedSet;
use crate::state_capture::{CaptureFailure, ModuleStateSnapshot};

/// Version of the on-disk layout
pub const SCHEMA_VERSION: u32 = 1;

const MANIFEST: &str = "manifest.json";
const BUNDLE_INFO: &str = "bundle.json";
const FINGERPRINTS: &str = "fingerprints.json";
const PIPELINE: &str = "pipeline.json";
const SEEDS: &str = "seeds.json";
const ENVIRONMENT: &str = "environment.json";
const CAPTURE_ERRORS: &str = "capture_errors.json";
const METHODS: &str = "methods.md";
const MODULE_STATES_DIR: &str = "module_states/";
const RESULTS_DIR: &str = "results/";

const REQUIRED_FILES: &[&str] = &[
    BUNDLE_INFO,
    FINGERPRINTS,
    PIPELINE,
    SEEDS,
    ENVIRONMENT,
    CAPTURE_ERRORS,
    METHODS,
];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Export encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleFormat {
    Json,
    MessagePack,
    Zip,
}

/// Container compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Deflate,
}

/// Reject format/compression combinations that cannot be honoured
pub(crate) fn check_options(format: BundleFormat, compression: Compression) -> Result<()> {
    if compression == Compression::Deflate && format != BundleFormat::Zip {
        return Err(ReproError::InvalidConfig(format!(
            "deflate compression requires the zip format, not {:?}",
            format
        )));
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    checksum: String,
    bundle: BundleBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    schema_version: u32,
    checksum: String,
    created_at: DateTime<Utc>,
    bundle_id: Uuid,
    files: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct BundleInfo {
    id: Uuid,
    created_at: DateTime<Utc>,
    creator: String,
    description: String,
}

fn corrupt(detail: impl Into<String>) -> ReproError {
    ReproError::CorruptBundle(detail.into())
}

fn write_error(e: zip::result::ZipError) -> ReproError {
    match e {
        zip::result::ZipError::Io(io) => ReproError::Io(io),
        other => ReproError::Serialization(format!("zip: {}", other)),
    }
}

// ============================================================================
// Export
// ============================================================================

/// Encode `bundle` in memory
pub fn export(bundle: &Bundle, format: BundleFormat, compression: Compression) -> Result<Vec<u8>> {
    export_with_cancel(bundle, format, compression, &CancellationToken::new())
}

/// Encode `bundle`, checking `cancel` between container entries
pub fn export_with_cancel(
    bundle: &Bundle,
    format: BundleFormat,
    compression: Compression,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    check_options(format, compression)?;
    cancel.check("export")?;

    let bytes = match format {
        BundleFormat::Json => canonical_bytes(&envelope_of(bundle))?,
        BundleFormat::MessagePack => rmp_serde::to_vec_named(&envelope_of(bundle))
            .map_err(|e| ReproError::Serialization(e.to_string()))?,
        BundleFormat::Zip => write_zip(&container_files(bundle)?, compression, cancel)?,
    };
    debug!(bundle = %bundle.id(), ?format, bytes = bytes.len(), "bundle encoded");
    Ok(bytes)
}

fn envelope_of(bundle: &Bundle) -> Envelope {
    Envelope {
        schema_version: SCHEMA_VERSION,
        checksum: bundle.checksum().to_string(),
        bundle: bundle.body().clone(),
    }
}

/// Every container file except the manifest, plus the manifest last
fn container_files(bundle: &Bundle) -> Result<BTreeMap<String, Vec<u8>>> {
    let body = bundle.body();
    let mut files = BTreeMap::new();

    let info = BundleInfo {
        id: body.id,
        created_at: body.created_at,
        creator: body.creator.clone(),
        description: body.description.clone(),
    };
    files.insert(BUNDLE_INFO.to_string(), canonical_bytes(&info)?);
    files.insert(FINGERPRINTS.to_string(), canonical_bytes(&body.fingerprints)?);
    let log = PipelineLog {
        steps: body.steps.clone(),
        decisions: body.decisions.clone(),
    };
    files.insert(PIPELINE.to_string(), canonical_bytes(&log)?);
    files.insert(SEEDS.to_string(), canonical_bytes(&body.seeds)?);
    files.insert(ENVIRONMENT.to_string(), canonical_bytes(&body.environment)?);
    files.insert(CAPTURE_ERRORS.to_string(), canonical_bytes(&body.capture_errors)?);
    files.insert(METHODS.to_string(), body.methods_text.as_bytes().to_vec());
    for (module, snapshot) in &body.module_states {
        files.insert(
            format!("{}{}.json", MODULE_STATES_DIR, module),
            canonical_bytes(snapshot)?,
        );
    }
    for (module, result) in &body.results {
        files.insert(format!("{}{}.json", RESULTS_DIR, module), canonical_bytes(result)?);
    }

    let manifest = Manifest {
        schema_version: SCHEMA_VERSION,
        checksum: bundle.checksum().to_string(),
        created_at: body.created_at,
        bundle_id: body.id,
        files: files
            .iter()
            .map(|(path, bytes)| (path.clone(), sha256_hex(bytes)))
            .collect(),
    };
    files.insert(MANIFEST.to_string(), canonical_bytes(&manifest)?);
    Ok(files)
}

fn write_zip(
    files: &BTreeMap<String, Vec<u8>>,
    compression: Compression,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let method = match compression {
        Compression::None => zip::CompressionMethod::Stored,
        Compression::Deflate => zip::CompressionMethod::Deflated,
    };
    // Fixed timestamps keep the archive bytes a function of the bundle alone.
    let options = zip::write::FileOptions::default()
        .compression_method(method)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, bytes) in files {
        cancel.check("export")?;
        writer.start_file(path.as_str(), options).map_err(write_error)?;
        writer.write_all(bytes)?;
    }
    let cursor = writer.finish().map_err(write_error)?;
    Ok(cursor.into_inner())
}

/// Sibling path used while a write is in progress
fn staging_path(target: &Path) -> Result<PathBuf> {
    let name = target.file_name().ok_or_else(|| {
        ReproError::InvalidConfig(format!("'{}' has no file name", target.display()))
    })?;
    let staged = format!(".{}.partial-{}", name.to_string_lossy(), Uuid::new_v4().simple());
    Ok(target.with_file_name(staged))
}

/// Export to a single file, replacing it atomically
pub fn export_to_path(
    bundle: &Bundle,
    path: impl AsRef<Path>,
    format: BundleFormat,
    compression: Compression,
) -> Result<()> {
    export_to_path_with_cancel(bundle, path, format, compression, &CancellationToken::new())
}

/// Export to a single file; a cancelled export leaves nothing on disk
pub fn export_to_path_with_cancel(
    bundle: &Bundle,
    path: impl AsRef<Path>,
    format: BundleFormat,
    compression: Compression,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = path.as_ref();
    let bytes = export_with_cancel(bundle, format, compression, cancel)?;

    let staged = staging_path(path)?;
    let written = fs::write(&staged, &bytes).and_then(|()| fs::rename(&staged, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }
    info!(bundle = %bundle.id(), path = %path.display(), ?format, "bundle exported");
    Ok(())
}

/// Export as an unpacked container directory
///
/// `dir` must not exist yet. The tree is written to a staging directory and
/// renamed into place.
pub fn export_to_dir(bundle: &Bundle, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if dir.exists() {
        return Err(ReproError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", dir.display()),
        )));
    }

    let files = container_files(bundle)?;
    let staged = staging_path(dir)?;
    let written = write_tree(&staged, &files).and_then(|()| fs::rename(&staged, dir));
    if let Err(e) = written {
        let _ = fs::remove_dir_all(&staged);
        return Err(e.into());
    }
    info!(bundle = %bundle.id(), dir = %dir.display(), "bundle exported as directory");
    Ok(())
}

fn write_tree(root: &Path, files: &BTreeMap<String, Vec<u8>>) -> std::io::Result<()> {
    fs::create_dir_all(root.join(MODULE_STATES_DIR))?;
    fs::create_dir_all(root.join(RESULTS_DIR))?;
    for (path, bytes) in files {
        fs::write(root.join(path), bytes)?;
    }
    Ok(())
}

// ============================================================================
// Import
// ============================================================================

/// Decode and verify a bundle, sniffing the format from its first bytes
pub fn import(bytes: &[u8]) -> Result<Bundle> {
    let bundle = if bytes.starts_with(ZIP_MAGIC) {
        read_container(read_zip(bytes)?)?
    } else if bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| corrupt(format!("invalid JSON envelope: {}", e)))?;
        open_envelope(envelope)?
    } else if bytes.is_empty() {
        return Err(corrupt("empty input"));
    } else {
        let envelope: Envelope = rmp_serde::from_slice(bytes)
            .map_err(|e| corrupt(format!("invalid MessagePack envelope: {}", e)))?;
        open_envelope(envelope)?
    };
    info!(bundle = %bundle.id(), checksum = bundle.checksum(), "bundle imported");
    Ok(bundle)
}

/// Import a bundle file, or a container directory
pub fn import_from_path(path: impl AsRef<Path>) -> Result<Bundle> {
    let path = path.as_ref();
    if path.is_dir() {
        return import_from_dir(path);
    }
    import(&fs::read(path)?)
}

/// Import an unpacked container directory
pub fn import_from_dir(dir: impl AsRef<Path>) -> Result<Bundle> {
    let dir = dir.as_ref();
    let mut files = BTreeMap::new();
    collect_tree(dir, "", &mut files)?;
    let bundle = read_container(files)?;
    info!(bundle = %bundle.id(), dir = %dir.display(), "bundle imported from directory");
    Ok(bundle)
}

fn collect_tree(dir: &Path, prefix: &str, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = format!("{}{}", prefix, name);
        if entry.file_type()?.is_dir() {
            collect_tree(&entry.path(), &format!("{}/", relative), files)?;
        } else {
            files.insert(relative, fs::read(entry.path())?);
        }
    }
    Ok(())
}

fn read_zip(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let unreadable = |e: zip::result::ZipError| corrupt(format!("unreadable zip: {}", e));
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(unreadable)?;
    let mut files = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(unreadable)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut buf = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut buf)
            .map_err(|e| corrupt(format!("cannot read '{}': {}", name, e)))?;
        if files.insert(name.clone(), buf).is_some() {
            return Err(corrupt(format!("duplicate entry '{}'", name)));
        }
    }
    Ok(files)
}

fn open_envelope(envelope: Envelope) -> Result<Bundle> {
    check_schema(envelope.schema_version)?;
    Bundle::verified(envelope.bundle, &envelope.checksum)
}

fn check_schema(version: u32) -> Result<()> {
    if version != SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema version {} (expected {})",
            version, SCHEMA_VERSION
        )));
    }
    Ok(())
}

fn parse<T: DeserializeOwned>(files: &BTreeMap<String, Vec<u8>>, path: &str) -> Result<T> {
    let bytes = files
        .get(path)
        .ok_or_else(|| corrupt(format!("missing '{}'", path)))?;
    serde_json::from_slice(bytes).map_err(|e| corrupt(format!("cannot parse '{}': {}", path, e)))
}

/// Module name encoded in `<dir><name>.json`
fn module_of(path: &str, dir: &str) -> Result<String> {
    let name = path
        .strip_prefix(dir)
        .and_then(|rest| rest.strip_suffix(".json"))
        .ok_or_else(|| corrupt(format!("unexpected file '{}'", path)))?;
    validate_name(name).map_err(|e| corrupt(format!("'{}': {}", path, e)))?;
    Ok(name.to_string())
}

fn read_container(files: BTreeMap<String, Vec<u8>>) -> Result<Bundle> {
    let manifest: Manifest = parse(&files, MANIFEST)?;
    check_schema(manifest.schema_version)?;

    // The manifest lists exactly the other files, each with its digest.
    for (path, bytes) in &files {
        if path == MANIFEST {
            continue;
        }
        let listed = manifest
            .files
            .get(path)
            .ok_or_else(|| corrupt(format!("unexpected file '{}'", path)))?;
        let actual = sha256_hex(bytes);
        if &actual != listed {
            return Err(corrupt(format!(
                "digest mismatch for '{}': manifest {}, actual {}",
                path, listed, actual
            )));
        }
    }
    if let Some(missing) = manifest.files.keys().find(|p| !files.contains_key(p.as_str())) {
        return Err(corrupt(format!("missing '{}'", missing)));
    }
    if let Some(missing) = REQUIRED_FILES.iter().find(|p| !files.contains_key(**p)) {
        return Err(corrupt(format!("missing '{}'", missing)));
    }

    let info: BundleInfo = parse(&files, BUNDLE_INFO)?;
    if info.id != manifest.bundle_id || info.created_at != manifest.created_at {
        return Err(corrupt("manifest does not describe this bundle"));
    }
    let fingerprints: BTreeMap<String, Fingerprint> = parse(&files, FINGERPRINTS)?;
    let log: PipelineLog = parse(&files, PIPELINE)?;
    let seeds: SeedSet = parse(&files, SEEDS)?;
    let environment: EnvironmentInfo = parse(&files, ENVIRONMENT)?;
    let capture_errors: Vec<CaptureFailure> = parse(&files, CAPTURE_ERRORS)?;
    let methods_bytes = files
        .get(METHODS)
        .cloned()
        .ok_or_else(|| corrupt(format!("missing '{}'", METHODS)))?;
    let methods_text = String::from_utf8(methods_bytes)
        .map_err(|e| corrupt(format!("'{}' is not UTF-8: {}", METHODS, e)))?;

    let mut module_states = BTreeMap::new();
    let mut results = BTreeMap::new();
    for path in files.keys() {
        if path.starts_with(MODULE_STATES_DIR) {
            let snapshot: ModuleStateSnapshot = parse(&files, path)?;
            module_states.insert(module_of(path, MODULE_STATES_DIR)?, snapshot);
        } else if path.starts_with(RESULTS_DIR) {
            let result: Value = parse(&files, path)?;
            results.insert(module_of(path, RESULTS_DIR)?, result);
        } else if path != MANIFEST && !REQUIRED_FILES.contains(&path.as_str()) {
            return Err(corrupt(format!("unexpected file '{}'", path)));
        }
    }

    let body = BundleBody {
        id: info.id,
        created_at: info.created_at,
        creator: info.creator,
        description: info.description,
        fingerprints,
        steps: log.steps,
        decisions: log.decisions,
        seeds,
        module_states,
        capture_errors,
        environment,
        results,
        methods_text,
    };
    Bundle::verified(body, &manifest.checksum)
}
