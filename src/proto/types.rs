/// A remote file's metadata snapshot as announced in an index message. Immutable once
///  received; ownership passes to the receiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub blocks: Vec<BlockInfo>,
}

/// One content-addressed chunk descriptor within a file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    pub length: u32,
    pub hash: Vec<u8>,
}

/// A block fetch request: the peer is asked for `size` bytes of `name` starting at
///  `offset`, expected to hash to `hash`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRequest {
    pub name: String,
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
}
