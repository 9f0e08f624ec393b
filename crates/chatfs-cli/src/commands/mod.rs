pub mod info;
pub mod keygen;
pub mod mount;
