//! Saving and loading [`Cfg`] documents.
//!
//! A document is stored either as JSON (textual) or with `bincode`
//! (binary). Both encodings wrap the CFG in an envelope carrying a format
//! version.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::info;
use crate::cfg::*;
use crate::error::*;

/// Version of the interchange envelope written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// The encoding of a stored document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrFormat {
    Json,
    Binary,
}
impl IrFormat {
    /// Pick a format from a file extension: `.json` is textual, anything
    /// else is binary.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Binary,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    cfg: &'a Cfg,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    cfg: Cfg,
}

impl Cfg {
    /// Encode this document into `w`.
    pub fn to_writer<W: Write>(&self, w: W, format: IrFormat) -> Result<()> {
        let env = EnvelopeRef { version: FORMAT_VERSION, cfg: self };
        match format {
            IrFormat::Json => serde_json::to_writer_pretty(w, &env)?,
            IrFormat::Binary => bincode::serialize_into(w, &env)?,
        }
        Ok(())
    }

    /// Decode and validate a document from `r`.
    pub fn from_reader<R: Read>(r: R, format: IrFormat) -> Result<Cfg> {
        let env: Envelope = match format {
            IrFormat::Json => serde_json::from_reader(r)?,
            IrFormat::Binary => bincode::deserialize_from(r)?,
        };
        if env.version != FORMAT_VERSION {
            return Err(Error::structural(format!(
                "unsupported document version {} (expected {})",
                env.version, FORMAT_VERSION
            )));
        }
        env.cfg.validate()?;
        Ok(env.cfg)
    }

    /// Write this document to `path`, using the encoding implied by the
    /// file extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let format = IrFormat::from_path(path);
        let f = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut w = BufWriter::new(f);
        self.to_writer(&mut w, format)?;
        w.flush().map_err(|e| Error::io(path, e))?;
        info!(path = %path.display(), ?format, "saved CFG");
        Ok(())
    }

    /// Read a document from `path`, using the encoding implied by the file
    /// extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Cfg> {
        let path = path.as_ref();
        let format = IrFormat::from_path(path);
        let f = File::open(path).map_err(|e| Error::io(path, e))?;
        let cfg = Self::from_reader(BufReader::new(f), format)?;
        info!(path = %path.display(), ?format,
            functions = cfg.num_functions(), "loaded CFG");
        Ok(cfg)
    }
}
