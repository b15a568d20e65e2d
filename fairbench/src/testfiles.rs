// Copyright (c) Facebook, Inc. and its affiliates.
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

use fair_util::*;

const CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid test file size {size:?} ({reason})")]
    BadSize { size: String, reason: String },
    #[error("failed to create {path:?} ({source})")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Reused(u64),
    Created(u64),
}

fn progress_bar(size: u64, hidden: bool) -> ProgressBar {
    let bar = match hidden {
        false => ProgressBar::new(size),
        true => ProgressBar::hidden(),
    };
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        Ok(style) => bar.set_style(style.progress_chars("#>-")),
        Err(e) => debug!("testfiles: progress bar template error ({})", &e),
    }
    bar
}

/// Make sure a file of at least `size` exists at `path`. An existing file
/// which is large enough is left untouched.
pub fn ensure(size: &str, path: &Path, show_progress: bool) -> Result<Provisioned, ProvisionError> {
    let bytes = match parse_size(size) {
        Ok(0) => {
            return Err(ProvisionError::BadSize {
                size: size.to_string(),
                reason: "zero size".into(),
            })
        }
        Ok(v) => v,
        Err(e) => {
            return Err(ProvisionError::BadSize {
                size: size.to_string(),
                reason: format!("{}", &e),
            })
        }
    };

    if let Ok(md) = path.metadata() {
        if md.is_file() && md.len() >= bytes {
            info!(
                "testfiles: using existing {:?} ({})",
                path,
                format_size(md.len())
            );
            return Ok(Provisioned::Reused(md.len()));
        }
    }

    let io_err = |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    };

    info!("testfiles: creating {:?} ({})", path, format_size(bytes));
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(io_err)?;

    let bar = progress_bar(bytes, !show_progress);
    let mut rng = SmallRng::from_entropy();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    while written < bytes {
        let len = (bytes - written).min(CHUNK_SIZE as u64) as usize;
        fill_area_with_random(&mut buf[..len], &mut rng);
        f.write_all(&buf[..len]).map_err(io_err)?;
        written += len as u64;
        bar.set_position(written);
    }
    f.sync_all().map_err(io_err)?;
    bar.finish_and_clear();

    Ok(Provisioned::Created(bytes))
}

/// Backing files keyed by their size expression, provisioned once each.
#[derive(Debug)]
pub struct TestFiles {
    dir: PathBuf,
    show_progress: bool,
    files: BTreeMap<String, PathBuf>,
}

impl TestFiles {
    pub fn new<P: AsRef<Path>>(dir: P, show_progress: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            show_progress,
            files: BTreeMap::new(),
        }
    }

    pub fn path_for(&self, size: &str) -> PathBuf {
        self.dir.join(format!("test_file_{}", size))
    }

    pub fn prepare<'a, I: IntoIterator<Item = &'a String>>(
        &mut self,
        sizes: I,
    ) -> Result<(), ProvisionError> {
        for size in sizes {
            if self.files.contains_key(size) {
                continue;
            }
            let path = self.path_for(size);
            ensure(size, &path, self.show_progress)?;
            self.files.insert(size.clone(), path);
        }
        Ok(())
    }

    pub fn path(&self, size: &str) -> Option<&Path> {
        self.files.get(size).map(|p| p.as_path())
    }

    pub fn drop_caches(&self) {
        for path in self.files.values() {
            match fs::File::open(path) {
                Ok(f) => {
                    let rc = unsafe {
                        libc::posix_fadvise(f.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED)
                    };
                    if rc != 0 {
                        warn!(
                            "testfiles: failed to drop caches for {:?}, fadvise failed ({:?})",
                            path, rc
                        );
                    }
                }
                Err(e) => warn!(
                    "testfiles: failed to drop caches for {:?}, open failed ({:?})",
                    path, &e
                ),
            }
        }
    }
}
