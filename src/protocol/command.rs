//! Retrieval command decoding and validation
//!
//! Two opcode namespaces share one [`Command`] type:
//!
//! | Opcode | Len    | Fields                     | Command            |
//! |--------|--------|----------------------------|--------------------|
//! | 0x00   | 2 or 6 | file_num, [offset:4 BE]    | legacy read        |
//! | 0x01   | 2      | file_num                   | legacy delete      |
//! | 0x02   | 2      | file_num (ignored)         | nuke               |
//! | 0x03   | 2      | file_num (ignored)         | stop               |
//! | 0x10   | 1      |                            | list files         |
//! | 0x11   | 2 or 6 | index, [offset:4 BE]       | read by index      |
//! | 0x12   | 2      | index                      | delete by index    |
//! | 0x32   | 2      |                            | heartbeat          |

use crate::error::CommandError;
use crate::retrieval::catalog::{CatalogCache, CatalogEntry};

pub const OP_LEGACY_READ: u8 = 0x00;
pub const OP_LEGACY_DELETE: u8 = 0x01;
pub const OP_LEGACY_NUKE: u8 = 0x02;
pub const OP_LEGACY_STOP: u8 = 0x03;
pub const OP_LIST_FILES: u8 = 0x10;
pub const OP_READ_FILE: u8 = 0x11;
pub const OP_DELETE_FILE: u8 = 0x12;
pub const OP_HEARTBEAT: u8 = 0x32;

/// How a command names its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRef {
    /// Legacy 1-based file number; packets carry no file tag
    Current(u8),
    /// 0-based index into the last listed catalog; packets are tagged
    Index(u8),
}

impl FileRef {
    /// Position in the catalog, `None` for legacy number 0
    pub fn catalog_index(&self) -> Option<usize> {
        match *self {
            FileRef::Current(0) => None,
            FileRef::Current(n) => Some(n as usize - 1),
            FileRef::Index(i) => Some(i as usize),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, FileRef::Current(_))
    }
}

/// Decoded retrieval command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ListFiles,
    ReadFile { file: FileRef, offset: u32 },
    DeleteFile { file: FileRef },
    Nuke,
    Stop,
    Heartbeat,
}

fn check_len(opcode: u8, len: usize, allowed: &[usize]) -> Result<(), CommandError> {
    if allowed.contains(&len) {
        Ok(())
    } else {
        Err(CommandError::InvalidLength { opcode, len })
    }
}

fn optional_offset(bytes: &[u8]) -> u32 {
    if bytes.len() == 6 {
        u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])
    } else {
        0
    }
}

impl Command {
    /// Decode a legacy single-file command
    pub fn from_legacy_bytes(bytes: &[u8]) -> Result<Self, CommandError> {
        let (&opcode, _) = bytes
            .split_first()
            .ok_or(CommandError::InvalidLength { opcode: 0, len: 0 })?;
        match opcode {
            OP_LEGACY_READ => {
                check_len(opcode, bytes.len(), &[2, 6])?;
                Ok(Command::ReadFile {
                    file: FileRef::Current(bytes[1]),
                    offset: optional_offset(bytes),
                })
            }
            OP_LEGACY_DELETE => {
                check_len(opcode, bytes.len(), &[2])?;
                Ok(Command::DeleteFile {
                    file: FileRef::Current(bytes[1]),
                })
            }
            OP_LEGACY_NUKE => {
                check_len(opcode, bytes.len(), &[2])?;
                Ok(Command::Nuke)
            }
            OP_LEGACY_STOP => {
                check_len(opcode, bytes.len(), &[2])?;
                Ok(Command::Stop)
            }
            OP_HEARTBEAT => {
                check_len(opcode, bytes.len(), &[2])?;
                Ok(Command::Heartbeat)
            }
            other => Err(CommandError::UnknownOpcode(other)),
        }
    }

    /// Decode a multi-file command
    pub fn from_v2_bytes(bytes: &[u8]) -> Result<Self, CommandError> {
        let (&opcode, _) = bytes
            .split_first()
            .ok_or(CommandError::InvalidLength { opcode: 0, len: 0 })?;
        match opcode {
            OP_LIST_FILES => {
                check_len(opcode, bytes.len(), &[1])?;
                Ok(Command::ListFiles)
            }
            OP_READ_FILE => {
                check_len(opcode, bytes.len(), &[2, 6])?;
                Ok(Command::ReadFile {
                    file: FileRef::Index(bytes[1]),
                    offset: optional_offset(bytes),
                })
            }
            OP_DELETE_FILE => {
                check_len(opcode, bytes.len(), &[2])?;
                Ok(Command::DeleteFile {
                    file: FileRef::Index(bytes[1]),
                })
            }
            other => Err(CommandError::UnknownOpcode(other)),
        }
    }

    /// Decode either namespace, dispatching on the opcode
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        match bytes.first() {
            None => Err(CommandError::InvalidLength { opcode: 0, len: 0 }),
            Some(&(OP_LIST_FILES | OP_READ_FILE | OP_DELETE_FILE)) => Self::from_v2_bytes(bytes),
            Some(_) => Self::from_legacy_bytes(bytes),
        }
    }

    pub fn file_ref(&self) -> Option<FileRef> {
        match *self {
            Command::ReadFile { file, .. } | Command::DeleteFile { file } => Some(file),
            _ => None,
        }
    }
}

/// Command accepted by the parser, with its file resolved against the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: Command,
    pub target: Option<CatalogEntry>,
}

/// Decodes and validates commands on the callback side.
///
/// Only the cached catalog is consulted here; no filesystem access.
#[derive(Debug, Clone)]
pub struct CommandParser {
    catalog: CatalogCache,
    slice_len: u32,
}

impl CommandParser {
    pub fn new(catalog: CatalogCache, slice_len: usize) -> Self {
        Self {
            catalog,
            slice_len: slice_len.clamp(1, u32::MAX as usize) as u32,
        }
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<ParsedCommand, CommandError> {
        let command = Command::decode(bytes)?;
        match command {
            Command::ReadFile { file, offset } => {
                let target = self.resolve(file)?;
                if target.size == 0 {
                    return Err(CommandError::ZeroFileSize);
                }
                if offset >= target.size {
                    return Err(CommandError::OffsetBeyondEnd {
                        offset,
                        size: target.size,
                    });
                }
                // Older clients expect reads to restart on a slice boundary
                let offset = if file.is_legacy() {
                    offset - offset % self.slice_len
                } else {
                    offset
                };
                Ok(ParsedCommand {
                    command: Command::ReadFile { file, offset },
                    target: Some(target),
                })
            }
            Command::DeleteFile { file } => Ok(ParsedCommand {
                command,
                target: Some(self.resolve(file)?),
            }),
            _ => Ok(ParsedCommand {
                command,
                target: None,
            }),
        }
    }

    fn resolve(&self, file: FileRef) -> Result<CatalogEntry, CommandError> {
        file.catalog_index()
            .and_then(|index| self.catalog.get(index))
            .ok_or(CommandError::FileIndexOutOfRange)
    }
}
