//! Resource container (`FORM`/`IFRS`) loading
//!
//! Only the pieces the engine needs are interpreted: the chunk list, the
//! resource index, the release number, the story identity and the story
//! image itself.

use std::ops::Range;

use serde::Serialize;

use crate::error::{ContainerError, Result};
use crate::header::Header;

/// Four-byte chunk tag
pub type Tag = [u8; 4];

const FORM: &Tag = b"FORM";
const IFRS: &Tag = b"IFRS";
const RIDX: &Tag = b"RIdx";
const RELN: &Tag = b"RelN";
const IFHD: &Tag = b"IFhd";
const ZCOD: &Tag = b"ZCOD";
const EXEC: &Tag = b"Exec";

/// One chunk inside the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk tag
    pub tag: Tag,
    /// Offset of the tag within the container
    pub offset: usize,
    /// Payload range within the container
    pub data: Range<usize>,
}

/// Resource index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Usage tag (`Pict`, `Snd `, `Exec`, ...)
    pub usage: Tag,
    /// Resource number
    pub number: u32,
    /// Index into [`Container::chunks`]
    pub chunk: usize,
}

/// Release, serial and checksum identifying a story
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoryIdentity {
    /// Release number
    pub release: u16,
    /// Six-character serial
    pub serial: String,
    /// Header checksum
    pub checksum: u16,
}

impl StoryIdentity {
    /// Whether this identity names the story described by `header`.
    pub fn matches(&self, header: &Header) -> bool {
        self.release == header.release
            && self.serial == header.serial
            && self.checksum == header.checksum
    }
}

/// Parsed container
#[derive(Debug, Clone)]
pub struct Container {
    bytes: Vec<u8>,
    chunks: Vec<Chunk>,
    resources: Vec<Resource>,
    release: Option<u16>,
    identity: Option<StoryIdentity>,
}

fn tag_string(tag: &[u8]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

impl Container {
    /// Parse a container from its raw bytes.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != FORM {
            return Err(ContainerError::NotAForm.into());
        }
        if &bytes[8..12] != IFRS {
            return Err(ContainerError::NotResourceFile(tag_string(&bytes[8..12])).into());
        }
        let declared = be_u32(&bytes[4..8]) as usize;
        let end = declared
            .checked_add(8)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| ContainerError::ChunkOverrun {
                tag: "FORM".to_string(),
                offset: 0,
            })?;

        let mut chunks = Vec::new();
        let mut offset = 12;
        while offset + 8 <= end {
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&bytes[offset..offset + 4]);
            let len = be_u32(&bytes[offset + 4..offset + 8]) as usize;
            let start = offset + 8;
            let stop = start
                .checked_add(len)
                .filter(|&stop| stop <= end)
                .ok_or_else(|| ContainerError::ChunkOverrun {
                    tag: tag_string(&tag),
                    offset,
                })?;
            chunks.push(Chunk {
                tag,
                offset,
                data: start..stop,
            });
            offset = stop + (len & 1);
        }

        let mut container = Self {
            bytes,
            chunks,
            resources: Vec::new(),
            release: None,
            identity: None,
        };
        container.resources = container.read_index()?;
        container.release = container.chunk(RELN).map(|data| {
            if data.len() >= 2 { be_u16(data) } else { 0 }
        });
        container.identity = container.read_identity()?;
        tracing::debug!(
            chunks = container.chunks.len(),
            resources = container.resources.len(),
            "parsed resource container"
        );
        Ok(container)
    }

    fn read_index(&self) -> Result<Vec<Resource>> {
        let Some(data) = self.chunk(RIDX) else {
            return Ok(Vec::new());
        };
        if data.len() < 4 {
            return Err(ContainerError::ShortChunk {
                tag: "RIdx".to_string(),
                len: data.len(),
            }
            .into());
        }
        let count = be_u32(&data[0..4]) as usize;
        let needed = count.saturating_mul(12).saturating_add(4);
        if data.len() < needed {
            return Err(ContainerError::ShortChunk {
                tag: "RIdx".to_string(),
                len: data.len(),
            }
            .into());
        }

        data[4..needed]
            .chunks_exact(12)
            .map(|entry| {
                let mut usage = [0u8; 4];
                usage.copy_from_slice(&entry[0..4]);
                let start = be_u32(&entry[8..12]) as usize;
                let chunk = self
                    .chunks
                    .iter()
                    .position(|c| c.offset == start)
                    .ok_or(ContainerError::UnresolvedResource(start))?;
                Ok(Resource {
                    usage,
                    number: be_u32(&entry[4..8]),
                    chunk,
                })
            })
            .collect()
    }

    fn read_identity(&self) -> Result<Option<StoryIdentity>> {
        let Some(data) = self.chunk(IFHD) else {
            return Ok(None);
        };
        if data.len() < 10 {
            return Err(ContainerError::ShortChunk {
                tag: "IFhd".to_string(),
                len: data.len(),
            }
            .into());
        }
        Ok(Some(StoryIdentity {
            release: be_u16(&data[0..2]),
            serial: data[2..8].iter().map(|&b| b as char).collect(),
            checksum: be_u16(&data[8..10]),
        }))
    }

    /// All chunks in file order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Resource index entries.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Release number from `RelN`.
    pub fn release(&self) -> Option<u16> {
        self.release
    }

    /// Story identity from `IFhd`.
    pub fn identity(&self) -> Option<&StoryIdentity> {
        self.identity.as_ref()
    }

    /// Payload of the first chunk tagged `tag`.
    pub fn chunk(&self, tag: &Tag) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|c| &c.tag == tag)
            .map(|c| &self.bytes[c.data.clone()])
    }

    /// The executable story image.
    ///
    /// Prefers the `Exec` resource; falls back to the first `ZCOD` chunk.
    pub fn story(&self) -> Result<&[u8]> {
        let indexed = self
            .resources
            .iter()
            .find(|r| &r.usage == EXEC)
            .map(|r| &self.chunks[r.chunk])
            .filter(|c| &c.tag == ZCOD);
        match indexed {
            Some(chunk) => Ok(&self.bytes[chunk.data.clone()]),
            None => self
                .chunk(ZCOD)
                .ok_or_else(|| ContainerError::MissingChunk("ZCOD").into()),
        }
    }
}

/// Whether `bytes` starts like a container.
pub fn is_container(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[0..4] == FORM
}

/// Accept either a raw story image or a container holding one.
pub fn load_story_bytes(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if !is_container(&bytes) {
        return Ok(bytes);
    }
    let container = Container::parse(bytes)?;
    if let (Some(identity), Some(release)) = (container.identity(), container.release()) {
        if identity.release != release {
            tracing::warn!(
                identity = identity.release,
                release,
                "container release number disagrees with story identity"
            );
        }
    }
    Ok(container.story()?.to_vec())
}
