use std::{
    io::{self, Read},
    path::Path,
};

use anyhow::{bail, Context, Error};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use hawser_api::deployment::ArtifactInfo;
use osutils::hashing_reader::HashingReader;

pub mod writer;

pub const ARTIFACT_FORMAT: &str = "hawser-artifact";
pub const ARTIFACT_VERSION: u32 = 3;

const HEADER_ENTRY: &str = "header.json";
const SIGNATURE_ENTRY: &str = "header.sig";
const SCRIPTS_PREFIX: &str = "scripts/";
const DATA_PREFIX: &str = "data/";

/// One file carried by a payload. The checksum and size always refer to the
/// uncompressed content, regardless of how the file travels in the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file content.
    pub checksum: String,
}

/// Everything the installer dispatch needs to know about one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub payload_type: String,
    pub files: Vec<FileEntry>,
}

/// The signed artifact header: identity, compatibility, dependency data and
/// the table of contents for every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub format: String,
    pub version: u32,
    pub artifact: ArtifactInfo,
    pub payloads: Vec<PayloadHeader>,
}

impl Header {
    pub fn validate(&self) -> Result<(), Error> {
        if self.format != ARTIFACT_FORMAT {
            bail!("Unknown artifact format '{}'", self.format);
        }
        if self.version != ARTIFACT_VERSION {
            bail!("Unsupported artifact version {}", self.version);
        }
        if self.artifact.name.is_empty() {
            bail!("Artifact header carries no artifact name");
        }
        if self.payloads.is_empty() {
            bail!("Artifact carries no payloads");
        }
        if self.artifact.payload_types.len() != self.payloads.len()
            || self
                .artifact
                .payload_types
                .iter()
                .zip(&self.payloads)
                .any(|(t, p)| t != &p.payload_type)
        {
            bail!("Artifact payload types disagree with the payload table");
        }
        Ok(())
    }
}

/// Receives the pieces of an artifact in stream order.
///
/// `begin_payload`/`end_payload` bracket the files of each payload, so an
/// installer that needs a running consumer (an update module draining named
/// pipes) can be started and reaped at the right moments.
pub trait PayloadSink {
    fn header(&mut self, header: &Header) -> Result<(), Error>;

    fn script(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        let _ = (name, contents);
        Ok(())
    }

    fn begin_payload(&mut self, index: usize, payload: &PayloadHeader) -> Result<(), Error>;

    fn file(
        &mut self,
        index: usize,
        entry: &FileEntry,
        reader: &mut dyn Read,
    ) -> Result<(), Error>;

    fn end_payload(&mut self, index: usize) -> Result<(), Error>;
}

/// Streams an artifact out of `reader`, verifying as it goes.
///
/// The header is read (and, when `verify_key` is set, its signature checked)
/// before a single payload byte is consumed. Every payload file is piped
/// through a SHA-256 reader and checked against the header's checksum and
/// size once fully drained; compressed (`.zst`) entries are checked against
/// their uncompressed form.
pub fn stream<R: Read>(
    reader: R,
    verify_key: Option<&Path>,
    sink: &mut dyn PayloadSink,
) -> Result<Header, Error> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = archive.entries().context("Failed to open artifact")?;

    // Header first.
    let mut entry = entries
        .next()
        .context("Artifact is empty")?
        .context("Failed to read artifact entry")?;
    if entry_name(&entry)? != HEADER_ENTRY {
        bail!("Artifact does not start with '{HEADER_ENTRY}'");
    }
    let mut header_raw = Vec::new();
    entry
        .read_to_end(&mut header_raw)
        .context("Failed to read artifact header")?;

    let mut pending = entries.next().transpose().context("Failed to read artifact entry")?;

    // Signature immediately after the header.
    let mut signature = None;
    if let Some(entry) = pending.as_mut() {
        if entry_name(entry)? == SIGNATURE_ENTRY {
            let mut sig = String::new();
            entry
                .read_to_string(&mut sig)
                .context("Failed to read artifact signature")?;
            signature = Some(sig);
            pending = entries.next().transpose().context("Failed to read artifact entry")?;
        }
    }

    if let Some(key) = verify_key {
        let signature = signature
            .as_deref()
            .context("Artifact is unsigned but a verification key is configured")?;
        osutils::signature::verify_with_key_file(key, &header_raw, signature)
            .context("Artifact signature verification failed")?;
        debug!("Artifact signature verified");
    }

    let header: Header =
        serde_json::from_slice(&header_raw).context("Failed to parse artifact header")?;
    header.validate()?;
    sink.header(&header)?;

    let mut current_payload: Option<usize> = None;
    let mut seen_files = vec![0usize; header.payloads.len()];

    loop {
        let Some(mut entry) = pending else {
            break;
        };
        let name = entry_name(&entry)?;

        if let Some(script) = name.strip_prefix(SCRIPTS_PREFIX) {
            if current_payload.is_some() {
                bail!("Artifact script '{script}' arrived after payload data");
            }
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .with_context(|| format!("Failed to read artifact script '{script}'"))?;
            sink.script(script, &contents)?;
        } else if let Some(rest) = name.strip_prefix(DATA_PREFIX) {
            let (index, file_name) = rest
                .split_once('/')
                .with_context(|| format!("Malformed payload entry '{name}'"))?;
            let index: usize = index
                .parse()
                .with_context(|| format!("Malformed payload index in '{name}'"))?;
            let payload = header
                .payloads
                .get(index)
                .with_context(|| format!("Entry '{name}' exceeds the payload table"))?;

            // Payloads arrive in order; moving to the next one closes the
            // previous.
            match current_payload {
                Some(open) if open == index => {}
                Some(open) if open < index => {
                    sink.end_payload(open)?;
                    sink.begin_payload(index, payload)?;
                    current_payload = Some(index);
                }
                None => {
                    sink.begin_payload(index, payload)?;
                    current_payload = Some(index);
                }
                Some(open) => {
                    bail!("Payload {index} data arrived after payload {open}");
                }
            }

            let compressed = file_name.ends_with(".zst");
            let logical_name = file_name.strip_suffix(".zst").unwrap_or(file_name);
            let file_entry = payload
                .files
                .iter()
                .find(|f| f.name == logical_name)
                .with_context(|| {
                    format!("File '{logical_name}' is not declared by payload {index}")
                })?
                .clone();

            trace!(
                "Streaming payload {index} file '{}' ({} bytes)",
                file_entry.name,
                file_entry.size
            );

            if compressed {
                let decoder = zstd::stream::read::Decoder::new(&mut entry)
                    .context("Failed to open compressed payload file")?;
                let mut hashing = HashingReader::new(decoder);
                sink.file(index, &file_entry, &mut hashing)?;
                finish_file(&file_entry, &mut hashing)?;
            } else {
                let mut hashing = HashingReader::new(&mut entry);
                sink.file(index, &file_entry, &mut hashing)?;
                finish_file(&file_entry, &mut hashing)?;
            }
            seen_files[index] += 1;
        } else {
            bail!("Unexpected artifact entry '{name}'");
        }

        pending = entries.next().transpose().context("Failed to read artifact entry")?;
    }

    if let Some(open) = current_payload {
        sink.end_payload(open)?;
    }

    for (index, payload) in header.payloads.iter().enumerate() {
        if seen_files[index] != payload.files.len() {
            bail!(
                "Payload {index} declares {} files but the artifact carried {}",
                payload.files.len(),
                seen_files[index]
            );
        }
    }

    Ok(header)
}

/// Drains whatever the sink left unread and checks size and digest.
fn finish_file<R: Read>(entry: &FileEntry, hashing: &mut HashingReader<R>) -> Result<(), Error> {
    io::copy(hashing, &mut io::sink())
        .with_context(|| format!("Failed to drain payload file '{}'", entry.name))?;

    if hashing.consumed() != entry.size {
        bail!(
            "Payload file '{}' is {} bytes, header declares {}",
            entry.name,
            hashing.consumed(),
            entry.size
        );
    }
    let digest = hashing.hex_digest();
    if digest != entry.checksum.to_lowercase() {
        bail!(
            "Payload file '{}' checksum mismatch: got {digest}, expected {}",
            entry.name,
            entry.checksum
        );
    }
    Ok(())
}

fn entry_name<R: Read>(entry: &tar::Entry<R>) -> Result<String, Error> {
    Ok(entry
        .path()
        .context("Artifact entry has an unreadable path")?
        .to_string_lossy()
        .into_owned())
}

/// Reads only the header of an artifact, for inspection commands.
pub fn read_header<R: Read>(reader: R) -> Result<Header, Error> {
    struct HeaderOnly;
    impl PayloadSink for HeaderOnly {
        fn header(&mut self, _header: &Header) -> Result<(), Error> {
            Ok(())
        }
        fn begin_payload(&mut self, _index: usize, _payload: &PayloadHeader) -> Result<(), Error> {
            Ok(())
        }
        fn file(
            &mut self,
            _index: usize,
            _entry: &FileEntry,
            reader: &mut dyn Read,
        ) -> Result<(), Error> {
            io::copy(reader, &mut io::sink())?;
            Ok(())
        }
        fn end_payload(&mut self, _index: usize) -> Result<(), Error> {
            Ok(())
        }
    }
    stream(reader, None, &mut HeaderOnly)
}
