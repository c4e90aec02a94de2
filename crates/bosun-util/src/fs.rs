//! A thin wrapper around `std::fs` whose errors name the path involved.

use anyhow::{Context as _, Result};
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub struct Fs;

impl Fs {
    pub fn new() -> Self {
        Fs
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        fs::read(path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::create_dir_all(path).with_context(|| format!("creating directory {}", path.display()))
    }
}
