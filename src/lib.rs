pub mod error;
pub mod codec;
pub mod block;
pub mod layer_map;
pub mod header;
pub mod raw;
pub mod sniff;
pub mod config;
pub mod engine;
pub mod registry;
pub mod fs;
pub mod offline;

pub use error::{errno_result, Error, FormatError, Result};
pub use codec::{CodecError, CompressionMethod};
pub use block::Block;
pub use layer_map::LayerMap;
pub use header::{FileHeader, HEADER_REGION};
pub use config::EngineConfig;
pub use engine::{CompressedFile, FileAttr, InodeRekey, Mode};
pub use registry::{FileHandle, FileRegistry};
pub use fs::CompressFs;
