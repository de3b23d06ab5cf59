pub mod bitmap;
pub mod inode;
