//! World-level `turbo_index.twi`: an optional, strictly-advisory index of
//! one packed LOD descriptor byte per chunk. The engine never produces or
//! interprets the descriptor's bitfields itself; it only exposes a
//! path-keyed get/set and packs/unpacks the byte for callers that do.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

/// `[generated:1][height/16:4][biome_cat:3]`, as named in the glossary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LodDescriptor {
    pub generated: bool,
    pub height_div_16: u8,
    pub biome_cat: u8,
}

impl LodDescriptor {
    pub fn pack(self) -> u8 {
        ((self.generated as u8) << 7) | ((self.height_div_16 & 0x0F) << 3) | (self.biome_cat & 0x07)
    }

    pub fn unpack(byte: u8) -> Self {
        Self {
            generated: byte & 0x80 != 0,
            height_div_16: (byte >> 3) & 0x0F,
            biome_cat: byte & 0x07,
        }
    }
}

const RECORD_LEN: usize = 9; // cx: i32 BE, cz: i32 BE, descriptor byte

/// An append-only `(cx, cz, descriptor)` log, rebuilt into an in-memory
/// table on open. Later records for the same chunk shadow earlier ones
/// until [`TurboIndex::compact`] rewrites the file without them.
pub struct TurboIndex {
    path: PathBuf,
    table: Mutex<HashMap<(i32, i32), u8>>,
}

impl TurboIndex {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = Mutex::new(Self::load(&path)?);
        Ok(Self { path, table })
    }

    fn load(path: &Path) -> Result<HashMap<(i32, i32), u8>> {
        let mut table = HashMap::new();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(table),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut record = [0u8; RECORD_LEN];
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {
                    let cx = i32::from_be_bytes(record[0..4].try_into().unwrap());
                    let cz = i32::from_be_bytes(record[4..8].try_into().unwrap());
                    table.insert((cx, cz), record[8]);
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(table)
    }

    pub fn get(&self, cx: i32, cz: i32) -> Option<LodDescriptor> {
        self.table
            .lock()
            .get(&(cx, cz))
            .copied()
            .map(LodDescriptor::unpack)
    }

    pub fn set(&self, cx: i32, cz: i32, descriptor: LodDescriptor) -> Result<()> {
        let byte = descriptor.pack();
        self.table.lock().insert((cx, cz), byte);

        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&cx.to_be_bytes());
        record[4..8].copy_from_slice(&cz.to_be_bytes());
        record[8] = byte;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&record)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log with exactly one record per chunk, dropping every
    /// shadowed entry accumulated by repeated `set` calls.
    pub fn compact(&self) -> Result<()> {
        let table = self.table.lock();
        let tmp_path = self.path.with_extension("twi.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for (&(cx, cz), &byte) in table.iter() {
                let mut record = [0u8; RECORD_LEN];
                record[0..4].copy_from_slice(&cx.to_be_bytes());
                record[4..8].copy_from_slice(&cz.to_be_bytes());
                record[8] = byte;
                writer.write_all(&record)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
