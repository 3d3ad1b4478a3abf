//! MHL 1.1 style hash list: codec plus manifest file discovery and writing.
//!
//! A manifest maps forward-slash relative paths to size, modification time
//! and an xxHash64 digest:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <hashlist version="1.1">
//!   <creatorinfo>
//!     <name>tandem</name>
//!     ...
//!   </creatorinfo>
//!   <hash>
//!     <file>CLIPS/A001C003.mov</file>
//!     <size>5242880</size>
//!     <lastmodificationdate>2024-03-01T09:15:02Z</lastmodificationdate>
//!     <xxhash64>3f1c2b0a9d8e7f60</xxhash64>
//!   </hash>
//! </hashlist>
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const MANIFEST_VERSION: &str = "1.1";
pub const MANIFEST_EXTENSION: &str = "mhl";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const ROOT: &str = "hashlist";
const CREATOR: &str = "creatorinfo";
const HASH: &str = "hash";
const HASH_VALUE: &str = "xxhash64";
const HASH_VALUE_BE: &str = "xxhash64be";

/// One file recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Forward-slash relative path, unique within a manifest
    pub relative_path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// 16 lowercase hex characters
    pub hash: String,
}

/// Who wrote the manifest, and when.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatorInfo {
    pub name: String,
    pub version: String,
    pub username: String,
    pub hostname: String,
    pub tool: String,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
}

impl CreatorInfo {
    /// Creator info for this process, started at `start_date`.
    pub fn current(start_date: DateTime<Utc>) -> Self {
        Self {
            name: "tandem".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            username: current_username(),
            hostname: current_hostname(),
            tool: "tandem offload engine".to_string(),
            start_date: Some(start_date),
            finish_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    pub creator: CreatorInfo,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(creator: CreatorInfo) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            creator,
            entries: BTreeMap::new(),
        }
    }

    /// Insert an entry, normalizing its path. Returns the entry it replaced,
    /// if any.
    pub fn insert(&mut self, mut entry: ManifestEntry) -> Option<ManifestEntry> {
        entry.relative_path = normalize_separators(&entry.relative_path);
        self.entries.insert(entry.relative_path.clone(), entry)
    }

    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries.get(&normalize_separators(relative_path))
    }

    /// Entries sorted by relative path.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// Serialize a manifest to UTF-8 XML.
pub fn encode(manifest: &Manifest) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(encode_error)?;

    let mut root = BytesStart::new(ROOT);
    root.push_attribute(("version", manifest.version.as_str()));
    writer
        .write_event(Event::Start(root))
        .map_err(encode_error)?;

    let creator = &manifest.creator;
    start(&mut writer, CREATOR)?;
    text_element(&mut writer, "name", &creator.name)?;
    text_element(&mut writer, "version", &creator.version)?;
    text_element(&mut writer, "username", &creator.username)?;
    text_element(&mut writer, "hostname", &creator.hostname)?;
    text_element(&mut writer, "tool", &creator.tool)?;
    if let Some(date) = creator.start_date {
        text_element(&mut writer, "startdate", &format_date(date))?;
    }
    if let Some(date) = creator.finish_date {
        text_element(&mut writer, "finishdate", &format_date(date))?;
    }
    end(&mut writer, CREATOR)?;

    for entry in manifest.entries() {
        start(&mut writer, HASH)?;
        text_element(&mut writer, "file", &normalize_separators(&entry.relative_path))?;
        text_element(&mut writer, "size", &entry.size.to_string())?;
        if let Some(date) = entry.last_modified {
            text_element(&mut writer, "lastmodificationdate", &format_date(date))?;
        }
        text_element(&mut writer, HASH_VALUE, &entry.hash)?;
        end(&mut writer, HASH)?;
    }

    end(&mut writer, ROOT)?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse a manifest document.
///
/// Both `/` and `\` separators are accepted in `<file>`. Unknown elements
/// are ignored.
pub fn decode(bytes: &[u8]) -> Result<Manifest> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Format(format!("manifest is not valid UTF-8: {}", e)))?;
    let text = text.trim_start_matches('\u{feff}');

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut version: Option<String> = None;
    let mut root_closed = false;
    let mut creator = CreatorInfo::default();
    let mut entries: BTreeMap<String, ManifestEntry> = BTreeMap::new();
    let mut pending: Option<PendingEntry> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::Format(format!("malformed XML: {}", e)))?;

        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                if stack.is_empty() {
                    version = Some(read_root(&e, &name)?);
                } else if stack.len() == 1 && name == HASH {
                    pending = Some(PendingEntry::default());
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                if stack.is_empty() {
                    version = Some(read_root(&e, &name)?);
                    root_closed = true;
                }
            }
            Event::Text(t) => {
                if stack.len() != 3 {
                    continue;
                }
                let value = t
                    .unescape()
                    .map_err(|e| Error::Format(format!("bad text content: {}", e)))?
                    .into_owned();

                match stack[1].as_str() {
                    CREATOR => assign_creator_field(&mut creator, &stack[2], value),
                    HASH => {
                        if let Some(entry) = pending.as_mut() {
                            entry.assign(&stack[2], value)?;
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                let name = stack.pop().unwrap_or_default();
                if stack.is_empty() {
                    root_closed = true;
                } else if stack.len() == 1 && name == HASH {
                    if let Some(entry) = pending.take().and_then(PendingEntry::finish) {
                        let entry = entry?;
                        if entries.contains_key(&entry.relative_path) {
                            return Err(Error::Format(format!(
                                "duplicate entry for {}",
                                entry.relative_path
                            )));
                        }
                        entries.insert(entry.relative_path.clone(), entry);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let version = version.ok_or_else(|| Error::Format("missing <hashlist> root element".into()))?;
    if !root_closed {
        return Err(Error::Format("truncated manifest: <hashlist> never closed".into()));
    }

    Ok(Manifest {
        version,
        creator,
        entries,
    })
}

#[derive(Default)]
struct PendingEntry {
    file: Option<String>,
    size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    hash: Option<String>,
}

impl PendingEntry {
    fn assign(&mut self, field: &str, value: String) -> Result<()> {
        match field {
            "file" => self.file = Some(value),
            "size" => {
                let size = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Format(format!("invalid size '{}'", value)))?;
                self.size = Some(size);
            }
            "lastmodificationdate" => self.last_modified = parse_date(&value),
            HASH_VALUE | HASH_VALUE_BE => self.hash = Some(parse_hash(&value)?),
            _ => {}
        }
        Ok(())
    }

    /// `None` for entries that carry no file or no hash; they are skipped.
    fn finish(self) -> Option<Result<ManifestEntry>> {
        let (file, hash) = match (self.file, self.hash) {
            (Some(f), Some(h)) if !f.is_empty() && !h.is_empty() => (f, h),
            _ => {
                debug!("Skipping manifest entry without file or hash");
                return None;
            }
        };

        Some(validate_relative_path(&file).map(|relative_path| ManifestEntry {
            relative_path,
            size: self.size.unwrap_or(0),
            last_modified: self.last_modified,
            hash,
        }))
    }
}

/// A digest must be exactly 16 hex characters; it is stored lowercase.
fn parse_hash(value: &str) -> Result<String> {
    let hash = value.trim();
    if hash.len() != 16 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Format(format!("invalid xxhash64 value '{}'", hash)));
    }
    Ok(hash.to_ascii_lowercase())
}

fn read_root(e: &BytesStart<'_>, name: &str) -> Result<String> {
    if name != ROOT {
        return Err(Error::Format(format!(
            "root element is <{}>, expected <{}>",
            name, ROOT
        )));
    }

    let attr = e
        .try_get_attribute("version")
        .map_err(|err| Error::Format(format!("bad attribute: {}", err)))?
        .ok_or_else(|| Error::Format("missing version attribute on <hashlist>".into()))?;

    let value = attr
        .unescape_value()
        .map_err(|err| Error::Format(format!("bad version attribute: {}", err)))?;
    Ok(value.into_owned())
}

fn assign_creator_field(creator: &mut CreatorInfo, field: &str, value: String) {
    match field {
        "name" => creator.name = value,
        "version" => creator.version = value,
        "username" => creator.username = value,
        "hostname" => creator.hostname = value,
        "tool" => creator.tool = value,
        "startdate" => creator.start_date = parse_date(&value),
        "finishdate" => creator.finish_date = parse_date(&value),
        _ => {}
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(encode_error)?;
    Ok(())
}

fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(encode_error)?;
    Ok(())
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    start(writer, name)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(encode_error)?;
    end(writer, name)
}

fn encode_error(e: impl std::fmt::Display) -> Error {
    Error::Format(format!("failed to encode manifest: {}", e))
}

pub fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|d| d.with_timezone(&Utc)))
        .ok()
}

pub fn normalize_separators(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").map(str::to_string).unwrap_or(path)
}

/// Render a relative filesystem path with forward slashes.
pub fn relative_path_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize a manifest path and reject anything that could escape the root.
fn validate_relative_path(raw: &str) -> Result<String> {
    let path = normalize_separators(raw.trim());
    let escapes = path.starts_with('/')
        || path.split('/').any(|part| part == "..")
        || has_drive_prefix(&path);

    if path.is_empty() || escapes {
        return Err(Error::Format(format!("unsafe path in manifest: '{}'", raw)));
    }
    Ok(path)
}

/// `C:` or `C:/...`. A colon elsewhere is a legal file name character.
fn has_drive_prefix(path: &str) -> bool {
    match path.as_bytes() {
        [letter, b':'] => letter.is_ascii_alphabetic(),
        [letter, b':', b'/', ..] => letter.is_ascii_alphabetic(),
        _ => false,
    }
}

/// Resolve a manifest path against a root directory.
pub fn resolve(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

pub fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(MANIFEST_EXTENSION))
}

pub fn manifest_file_name(prefix: &str, at: DateTime<Local>) -> String {
    format!(
        "{}_{}.{}",
        prefix,
        at.format(FILE_STAMP_FORMAT),
        MANIFEST_EXTENSION
    )
}

/// Encode `manifest` into a freshly named, timestamped file inside `dir`.
///
/// Never overwrites: if the timestamped name is taken, `_1`, `_2`, ... is
/// appended.
pub fn write_manifest(manifest: &Manifest, dir: &Path, prefix: &str) -> Result<PathBuf> {
    let bytes = encode(manifest)?;
    let base = manifest_file_name(prefix, Local::now());
    let stem = base.trim_end_matches(&format!(".{}", MANIFEST_EXTENSION)).to_string();

    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{}_{}.{}", stem, attempt, MANIFEST_EXTENSION)
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&bytes)
                    .map_err(|e| Error::io("Failed to write manifest", &path, e))?;
                file.sync_all()
                    .map_err(|e| Error::io("Failed to sync manifest", &path, e))?;
                debug!(path = %path.display(), entries = manifest.len(), "Manifest written");
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(Error::io("Failed to create manifest", &path, e)),
        }
    }
}

/// Encode `manifest` to an explicit path, replacing any existing file.
pub fn write_manifest_to(manifest: &Manifest, path: &Path) -> Result<()> {
    let bytes = encode(manifest)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io("Failed to create directory", parent, e))?;
    }
    fs::write(path, bytes).map_err(|e| Error::io("Failed to write manifest", path, e))
}

pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes = fs::read(path).map_err(|e| Error::io("Failed to read manifest", path, e))?;
    decode(&bytes)
}

/// Find the authoritative manifest in `dir`: the most recently created
/// `*.mhl` file at the top level. Ties fall back to the file name, whose
/// timestamp stamp sorts chronologically.
pub fn find_latest_manifest(dir: &Path) -> Result<Option<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io("Failed to read directory", dir, e))?;

    let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("Failed to read directory entry in", dir, e))?;
        let path = entry.path();
        if !is_manifest_file(&path) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                continue;
            }
        };

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((created, path));
    }

    if candidates.len() > 1 {
        debug!(
            count = candidates.len(),
            dir = %dir.display(),
            "Multiple manifests found, using the most recent"
        );
    }

    Ok(candidates.into_iter().max().map(|(_, path)| path))
}

fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn current_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
