#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("short read at offset {offset}: wanted {wanted} bytes")]
    ShortRead { offset: u64, wanted: usize },
    #[error("volume: {0}")]
    Volume(#[from] VolumeError),
    #[error("selector: {0}")]
    Selector(#[from] SelectorError),
}

#[derive(thiserror::Error, Debug)]
pub enum VolumeError {
    #[error("malformed boot sector: {0}")]
    BootSector(&'static str),
    #[error("cluster chain corrupt at cluster {0:#x}")]
    ChainCorrupt(u32),
    #[error("the file or directory {0:?} doesn't exist")]
    FileNotFound(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SelectorError {
    #[error("slot {0}: reserved bytes are not zero")]
    RecordInvariant(u16),
    #[error("cannot set empty slot {0} as default")]
    EmptySlotDefault(u16),
    #[error("selector.adf not found")]
    SelectorMissing,
    #[error("no cluster found for file {0:?}")]
    Unmapped(String),
}

pub type Result<T> = core::result::Result<T, Error>;
