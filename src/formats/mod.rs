//! Binary persistence of trained quantizers
//!
//! All values are little-endian. A file starts with the quantizer header
//! (`LSQ1` or `RQ01` plus its parameters) followed by the shared state block:
//!
//! ```text
//! "AQST" version:u32 d:u32 M:u32 nbits:[u32; M] nseg:u32 segments:[u32; nseg]
//! search_type:u32 norm_min:f32 norm_max:f32 is_trained:u8
//! ncodebook:u64 codebooks:[f32; ncodebook]
//! ```
//!
//! The codebook table is stored in `(m, k, d)` order.

use crate::aq::{AqState, SearchType};
use crate::lsq::{LocalSearchQuantizer, LsqParams};
use crate::rq::{ResidualQuantizer, RqParams};
use crate::{AdditiveQuantizer, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const STATE_MAGIC: &[u8; 4] = b"AQST";
const LSQ_MAGIC: &[u8; 4] = b"LSQ1";
const RQ_MAGIC: &[u8; 4] = b"RQ01";
const FORMAT_VERSION: u32 = 1;

fn create(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| Error::Io(format!("{}: {}", path.display(), e)).into())
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::Io(format!("{}: {}", path.display(), e)).into())
}

fn read_magic<R: Read>(reader: &mut R, expected: &[u8; 4]) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != expected {
        return Err(Error::InvalidFormat(format!(
            "bad magic {:?}, expected {:?}",
            String::from_utf8_lossy(&magic),
            String::from_utf8_lossy(expected)
        ))
        .into());
    }
    Ok(())
}

fn read_len<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let v = reader.read_u32::<LittleEndian>()? as usize;
    // Sanity bound against corrupt headers
    if v > 1 << 24 {
        return Err(Error::InvalidFormat(format!("{} = {} is implausible", what, v)).into());
    }
    Ok(v)
}

/// Serialize the shared quantizer state
pub fn write_state<W: Write>(writer: &mut W, state: &AqState) -> Result<()> {
    writer.write_all(STATE_MAGIC)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    writer.write_u32::<LittleEndian>(state.d as u32)?;
    writer.write_u32::<LittleEndian>(state.m as u32)?;
    for &nb in &state.nbits {
        writer.write_u32::<LittleEndian>(nb as u32)?;
    }
    writer.write_u32::<LittleEndian>(state.segments.len() as u32)?;
    for &s in &state.segments {
        writer.write_u32::<LittleEndian>(s as u32)?;
    }
    writer.write_u32::<LittleEndian>(state.search_type.to_tag())?;
    writer.write_f32::<LittleEndian>(state.norm_min)?;
    writer.write_f32::<LittleEndian>(state.norm_max)?;
    writer.write_u8(state.is_trained as u8)?;

    writer.write_u64::<LittleEndian>(state.codebooks.len() as u64)?;
    for &v in &state.codebooks {
        writer.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

/// Deserialize a state written by [`write_state`]
pub fn read_state<R: Read>(reader: &mut R) -> Result<AqState> {
    read_magic(reader, STATE_MAGIC)?;
    let version = reader.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::InvalidFormat(format!("unsupported version {}", version)).into());
    }

    let d = read_len(reader, "d")?;
    let m = read_len(reader, "M")?;
    let mut nbits = Vec::with_capacity(m);
    for _ in 0..m {
        nbits.push(read_len(reader, "nbits")?);
    }
    let nseg = read_len(reader, "segment count")?;
    let mut segments = Vec::with_capacity(nseg);
    for _ in 0..nseg {
        segments.push(read_len(reader, "segment")?);
    }
    let tag = reader.read_u32::<LittleEndian>()?;
    let search_type =
        SearchType::from_tag(tag).ok_or_else(|| Error::InvalidFormat(format!("unknown search type {}", tag)))?;

    let mut state = AqState::with_segments(d, nbits, segments, search_type)
        .map_err(|e| Error::InvalidFormat(format!("invalid header: {}", e)))?;
    state.norm_min = reader.read_f32::<LittleEndian>()?;
    state.norm_max = reader.read_f32::<LittleEndian>()?;
    state.is_trained = reader.read_u8()? != 0;

    let len = reader.read_u64::<LittleEndian>()? as usize;
    let expected = state.total_codebook_size * state.d;
    if len != expected && !(len == 0 && !state.is_trained) {
        return Err(Error::InvalidFormat(format!(
            "codebook table has {} values, expected {} (M = {}, d = {})",
            len, expected, state.m, state.d
        ))
        .into());
    }
    let mut codebooks = vec![0.0f32; len];
    reader.read_f32_into::<LittleEndian>(&mut codebooks)?;
    state.codebooks = codebooks;

    if state.is_trained && state.search_type == SearchType::NormFromLut {
        state.compute_codebook_tables();
    }
    Ok(state)
}

/// Write a local search quantizer to `path`
pub fn save_lsq<P: AsRef<Path>>(path: P, lsq: &LocalSearchQuantizer) -> Result<()> {
    let mut writer = BufWriter::new(create(path.as_ref())?);
    let p = lsq.params();
    writer.write_all(LSQ_MAGIC)?;
    writer.write_u32::<LittleEndian>(p.train_iters as u32)?;
    writer.write_u32::<LittleEndian>(p.encode_ils_iters as u32)?;
    writer.write_u32::<LittleEndian>(p.train_ils_iters as u32)?;
    writer.write_u32::<LittleEndian>(p.icm_iters as u32)?;
    writer.write_f32::<LittleEndian>(p.p)?;
    writer.write_f32::<LittleEndian>(p.lambd)?;
    writer.write_u64::<LittleEndian>(p.chunk_size as u64)?;
    writer.write_u64::<LittleEndian>(p.random_seed)?;
    writer.write_u32::<LittleEndian>(p.nperts as u32)?;
    write_state(&mut writer, lsq.state())?;
    writer.flush()?;
    Ok(())
}

/// Read a local search quantizer written by [`save_lsq`]
pub fn load_lsq<P: AsRef<Path>>(path: P) -> Result<LocalSearchQuantizer> {
    let mut reader = BufReader::new(open(path.as_ref())?);
    read_magic(&mut reader, LSQ_MAGIC)?;
    let params = LsqParams {
        train_iters: reader.read_u32::<LittleEndian>()? as usize,
        encode_ils_iters: reader.read_u32::<LittleEndian>()? as usize,
        train_ils_iters: reader.read_u32::<LittleEndian>()? as usize,
        icm_iters: reader.read_u32::<LittleEndian>()? as usize,
        p: reader.read_f32::<LittleEndian>()?,
        lambd: reader.read_f32::<LittleEndian>()?,
        chunk_size: reader.read_u64::<LittleEndian>()? as usize,
        random_seed: reader.read_u64::<LittleEndian>()?,
        nperts: reader.read_u32::<LittleEndian>()? as usize,
    };
    let state = read_state(&mut reader)?;
    LocalSearchQuantizer::from_parts(state, params)
}

/// Write a residual quantizer to `path`
pub fn save_rq<P: AsRef<Path>>(path: P, rq: &ResidualQuantizer) -> Result<()> {
    let mut writer = BufWriter::new(create(path.as_ref())?);
    let p = rq.params();
    writer.write_all(RQ_MAGIC)?;
    writer.write_u32::<LittleEndian>(p.max_beam_size as u32)?;
    writer.write_u32::<LittleEndian>(p.niter as u32)?;
    writer.write_u64::<LittleEndian>(p.random_seed)?;
    writer.write_u64::<LittleEndian>(p.max_train_points as u64)?;
    write_state(&mut writer, rq.state())?;
    writer.flush()?;
    Ok(())
}

/// Read a residual quantizer written by [`save_rq`]
pub fn load_rq<P: AsRef<Path>>(path: P) -> Result<ResidualQuantizer> {
    let mut reader = BufReader::new(open(path.as_ref())?);
    read_magic(&mut reader, RQ_MAGIC)?;
    let params = RqParams {
        max_beam_size: reader.read_u32::<LittleEndian>()? as usize,
        niter: reader.read_u32::<LittleEndian>()? as usize,
        random_seed: reader.read_u64::<LittleEndian>()?,
        max_train_points: reader.read_u64::<LittleEndian>()? as usize,
    };
    let state = read_state(&mut reader)?;
    ResidualQuantizer::from_parts(state, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_random_vectors;
    use tempfile::tempdir;

    #[test]
    fn test_lsq_save_load() {
        let (d, n) = (8, 200);
        let x = generate_random_vectors(n, d, 41);
        let params = LsqParams::default().with_train_iters(2).with_ils_iters(2, 2).with_nperts(2);
        let mut lsq = LocalSearchQuantizer::with_params(d, 2, 4, SearchType::NormQint8, params).unwrap();
        lsq.train(n, &x).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("lsq.bin");
        save_lsq(&path, &lsq).unwrap();
        let loaded = load_lsq(&path).unwrap();

        assert_eq!(loaded.params(), lsq.params());
        assert_eq!(loaded.state().codebooks, lsq.state().codebooks);
        assert_eq!(loaded.state().norm_min, lsq.state().norm_min);

        let mut a = vec![0u8; n * lsq.code_size()];
        let mut b = vec![0u8; n * loaded.code_size()];
        lsq.compute_codes(&x, &mut a, n).unwrap();
        loaded.compute_codes(&x, &mut b, n).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rq_save_load_with_lut_tables() {
        let (d, n) = (4, 100);
        let x = generate_random_vectors(n, d, 42);
        let mut rq = ResidualQuantizer::new(d, 2, 3, SearchType::NormFromLut).unwrap();
        rq.train(n, &x).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("rq.bin");
        save_rq(&path, &rq).unwrap();
        let loaded = load_rq(&path).unwrap();

        assert_eq!(loaded.state().centroid_norms, rq.state().centroid_norms);
        assert_eq!(loaded.state().codebook_cross_products, rq.state().codebook_cross_products);
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let dir = tempdir().unwrap();

        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"NOPE0000").unwrap();
        let err = load_lsq(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidFormat(_))));

        let mut buf = Vec::new();
        let mut state = AqState::new(4, vec![2, 2], SearchType::Decompress).unwrap();
        state.codebooks = vec![1.0; 8 * 4];
        state.is_trained = true;
        write_state(&mut buf, &state).unwrap();
        assert!(read_state(&mut &buf[..]).is_ok());
        assert!(read_state(&mut &buf[..buf.len() - 4]).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = load_rq(dir.path().join("missing.bin")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Io(_))));
    }

    #[test]
    fn test_rejects_wrong_table_length() {
        let mut state = AqState::new(4, vec![2], SearchType::Decompress).unwrap();
        state.codebooks = vec![0.0; 3];
        state.is_trained = true;

        let mut buf = Vec::new();
        write_state(&mut buf, &state).unwrap();
        let err = read_state(&mut &buf[..]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidFormat(_))));
    }
}
