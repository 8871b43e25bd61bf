/// Files held by the RAM filesystem.
pub const MAX_FILES: usize = 64;

/// Longest file name, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 127;

pub const ROOT_INODE: u32 = 0;
pub const ROOT_PERMISSIONS: u16 = 0o755;
pub const FILE_PERMISSIONS: u16 = 0o644;
