// ABOUTME: Plain request/response types exchanged with a container runtime
// ABOUTME: Container specs, build contexts, file mounts and probe responses

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a runtime needs to create one container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Runtime-unique container name
    pub name: String,
    pub hostname: String,
    /// Image reference or built tag
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Option<String>,
    /// container port -> host port
    pub ports: BTreeMap<u16, u16>,
    pub files: Vec<FileMount>,
    /// Network the container joins, where peers reach it by `hostname`
    pub network: Option<String>,
}

/// A file placed into the container filesystem before it starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMount {
    /// Absolute path inside the container
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
    /// Uploaded without write permission bits. This does not stop root
    /// inside the container from writing the file.
    pub readonly: bool,
}

/// In-memory docker build context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildContext {
    pub tag: String,
    pub files: Vec<BuildFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildFile {
    /// Path relative to the context root
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

/// Result of a single HTTP readiness probe
#[derive(Debug, Clone, PartialEq)]
pub struct HttpProbeResponse {
    pub status: u16,
    pub body: String,
}

impl HttpProbeResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Build an uncompressed tar archive from `(path, content, mode)` entries
pub(crate) fn tar_entries<'a, I>(entries: I) -> std::io::Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8], u32)>,
{
    let mut archive = tar::Builder::new(Vec::new());

    for (path, content, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_cksum();
        archive.append_data(&mut header, path.trim_start_matches('/'), content)?;
    }

    archive.into_inner()
}
