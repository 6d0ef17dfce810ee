use std::io::Write;

use anyhow::{Context, Error};
use sha2::{Digest, Sha256};

use hawser_api::deployment::ArtifactInfo;

use super::{FileEntry, Header, PayloadHeader, ARTIFACT_FORMAT, ARTIFACT_VERSION};

struct StagedFile {
    name: String,
    compress: bool,
    contents: Vec<u8>,
}

struct StagedPayload {
    header: PayloadHeader,
    files: Vec<StagedFile>,
}

/// Assembles an artifact container: header, optional signature, optional
/// scripts, then the payload files. Used by artifact tooling and tests.
pub struct ArtifactBuilder {
    artifact: ArtifactInfo,
    scripts: Vec<(String, Vec<u8>)>,
    payloads: Vec<StagedPayload>,
    signing_key_pem: Option<Vec<u8>>,
    extra_entries: Vec<(String, Vec<u8>)>,
}

impl ArtifactBuilder {
    pub fn new(artifact: ArtifactInfo) -> Self {
        Self {
            artifact,
            scripts: Vec::new(),
            payloads: Vec::new(),
            signing_key_pem: None,
            extra_entries: Vec::new(),
        }
    }

    pub fn script(mut self, name: &str, contents: &[u8]) -> Self {
        self.scripts.push((name.to_string(), contents.to_vec()));
        self
    }

    /// Adds a payload; each file is (name, contents, compress).
    pub fn payload(mut self, payload_type: &str, files: Vec<(&str, Vec<u8>, bool)>) -> Self {
        let mut header_files = Vec::new();
        let mut staged = Vec::new();

        for (name, contents, compress) in files {
            header_files.push(FileEntry {
                name: name.to_string(),
                size: contents.len() as u64,
                checksum: hex::encode(Sha256::digest(&contents)),
            });
            staged.push(StagedFile {
                name: name.to_string(),
                compress,
                contents,
            });
        }

        self.payloads.push(StagedPayload {
            header: PayloadHeader {
                payload_type: payload_type.to_string(),
                files: header_files,
            },
            files: staged,
        });
        self
    }

    /// Declares a payload in the header without shipping its files; for
    /// testing truncated artifacts.
    pub fn payload_declared_only(
        mut self,
        payload_type: &str,
        files: Vec<(&str, Vec<u8>, bool)>,
    ) -> Self {
        self = self.payload(payload_type, files);
        if let Some(payload) = self.payloads.last_mut() {
            payload.files.clear();
        }
        self
    }

    /// Smuggles an arbitrary entry into the container; for testing rejection
    /// of undeclared content.
    pub fn extra_entry(mut self, name: &str, contents: &[u8]) -> Self {
        self.extra_entries.push((name.to_string(), contents.to_vec()));
        self
    }

    pub fn sign(mut self, private_key_pem: &[u8]) -> Self {
        self.signing_key_pem = Some(private_key_pem.to_vec());
        self
    }

    pub fn build(mut self) -> Result<Vec<u8>, Error> {
        self.artifact.payload_types = self
            .payloads
            .iter()
            .map(|p| p.header.payload_type.clone())
            .collect();

        let header = Header {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            artifact: self.artifact,
            payloads: self.payloads.iter().map(|p| p.header.clone()).collect(),
        };
        let header_raw =
            serde_json::to_vec_pretty(&header).context("Failed to serialize artifact header")?;

        let mut tar = tar::Builder::new(Vec::new());
        append(&mut tar, super::HEADER_ENTRY, &header_raw)?;

        if let Some(key) = &self.signing_key_pem {
            let signature = osutils::signature::sign_detached(key, &header_raw)
                .context("Failed to sign artifact header")?;
            append(&mut tar, super::SIGNATURE_ENTRY, signature.as_bytes())?;
        }

        for (name, contents) in &self.scripts {
            append(&mut tar, &format!("scripts/{name}"), contents)?;
        }

        for (index, payload) in self.payloads.iter().enumerate() {
            for file in &payload.files {
                if file.compress {
                    let compressed = zstd::stream::encode_all(&file.contents[..], 0)
                        .with_context(|| format!("Failed to compress '{}'", file.name))?;
                    append(
                        &mut tar,
                        &format!("data/{index:04}/{}.zst", file.name),
                        &compressed,
                    )?;
                } else {
                    append(
                        &mut tar,
                        &format!("data/{index:04}/{}", file.name),
                        &file.contents,
                    )?;
                }
            }
        }

        for (name, contents) in &self.extra_entries {
            append(&mut tar, name, contents)?;
        }

        tar.into_inner().context("Failed to finish artifact")
    }
}

fn append<W: Write>(tar: &mut tar::Builder<W>, name: &str, contents: &[u8]) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, contents)
        .with_context(|| format!("Failed to append artifact entry '{name}'"))
}
