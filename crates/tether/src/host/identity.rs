//! Content identity of plugin executables.

use std::fs::File;
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::Path;

use sha2::Digest;

/// Computes the identity string (lowercase hex digest) of a file
pub trait IdentityChecker: Send + Sync {
    fn parse(&self, file: &Path) -> io::Result<String>;
}

/// [`IdentityChecker`] hashing the whole file with digest `D`
pub struct DigestChecker<D> {
    _digest: PhantomData<fn() -> D>,
}

pub type Md5Checker = DigestChecker<md5::Md5>;
pub type Sha256Checker = DigestChecker<sha2::Sha256>;

impl<D> DigestChecker<D> {
    pub fn new() -> Self {
        Self {
            _digest: PhantomData,
        }
    }
}

impl<D> Default for DigestChecker<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> std::fmt::Debug for DigestChecker<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::any::type_name::<D>())
    }
}

impl<D: Digest> IdentityChecker for DigestChecker<D> {
    fn parse(&self, file: &Path) -> io::Result<String> {
        let mut file = File::open(file)?;
        let mut hasher = D::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
