pub mod base;
pub mod byte_io;
pub mod delta;
pub mod differ;
pub mod error;
pub mod freemem;
pub mod hashlist;
pub mod recover;
pub mod stream;
pub mod xdelta;
