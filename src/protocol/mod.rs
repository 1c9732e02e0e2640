//! Retrieval wire protocol: inbound commands and outbound notifications

pub mod codes;
pub mod command;

pub use codes::{encode_data_packet, encode_file_list, ResultCode};
pub use command::{Command, CommandParser, FileRef, ParsedCommand};
