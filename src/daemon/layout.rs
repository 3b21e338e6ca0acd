//! On-disk layout of an archived file
//!
//! ```text
//! <dir>/data.vda            payload (symlink to the submitted file)
//! <dir>/policy.txt
//! <dir>/chunk_sizes.txt
//! <dir>/Coding/data_k01.vda ... data_mKK.vda   encoder output
//! <dir>/data.<i>/data.vda   symlink to piece i, recursively encoded
//! ```
//!
//! A unit is on the server iff `data.vda` in its directory resolves to an
//! existing file.

use crate::coding::{Coding, Policy};
use crate::daemon::store::PlacementRecord;
use crate::error::VdaError;
use crate::storage::{CodingTree, Placement};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Payload name inside every unit directory
pub const DATA_FILE: &str = "data.vda";
/// Encoder output directory
pub const CODING_DIR: &str = "Coding";
/// Copy of the file's policy
pub const POLICY_FILE: &str = "policy.txt";

/// Directory of the unit at `path` below a file directory
pub fn unit_dir(file_dir: &Path, path: &[usize]) -> PathBuf {
    let mut dir = file_dir.to_path_buf();
    for i in path {
        dir.push(format!("data.{}", i));
    }
    dir
}

/// Encoder output name of piece `i`: data pieces first, then redundant ones
pub fn piece_file_name(coding: &Coding, i: usize) -> String {
    if i < coding.n {
        format!("data_k{:02}.vda", i + 1)
    } else {
        format!("data_m{:02}.vda", i - coding.n + 1)
    }
}

/// Erasure coder working on a unit directory
pub trait Coder {
    /// Split `dir/data.vda` into `coding.m` pieces under `dir/Coding`
    fn encode(&self, dir: &Path, coding: &Coding) -> Result<()>;

    /// Rebuild `dir/data.vda` from the pieces under `dir/Coding`
    fn decode(&self, dir: &Path, coding: &Coding) -> Result<()>;
}

/// Coder running external encoder/decoder programs
///
/// Both are invoked in the unit directory as `<program> data.vda <n> <k>`.
#[derive(Debug, Clone)]
pub struct ExternalCoder {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
}

impl ExternalCoder {
    pub fn new(encoder_path: &Path, decoder_path: &Path) -> Self {
        Self {
            encoder_path: encoder_path.to_path_buf(),
            decoder_path: decoder_path.to_path_buf(),
        }
    }

    fn run(program: &Path, dir: &Path, coding: &Coding) -> Result<()> {
        let command = format!("{} {} {} {}", program.display(), DATA_FILE, coding.n, coding.k);
        debug!(dir = %dir.display(), %command, "running coder");
        let status = Command::new(program)
            .arg(DATA_FILE)
            .arg(coding.n.to_string())
            .arg(coding.k.to_string())
            .current_dir(dir)
            .status()?;
        if !status.success() {
            return Err(VdaError::Subprocess {
                command,
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

impl Coder for ExternalCoder {
    fn encode(&self, dir: &Path, coding: &Coding) -> Result<()> {
        Self::run(&self.encoder_path, dir, coding)
    }

    fn decode(&self, dir: &Path, coding: &Coding) -> Result<()> {
        Self::run(&self.decoder_path, dir, coding)
    }
}

#[cfg(unix)]
fn link(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
fn link(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link)?;
    Ok(())
}

/// Make `dir/data.vda` point at `target`
pub fn link_payload(dir: &Path, target: &Path) -> Result<()> {
    let path = dir.join(DATA_FILE);
    if fs::symlink_metadata(&path).is_ok() {
        fs::remove_file(&path)?;
    }
    link(target, &path)
}

/// Encode the tree below `dir` and record the piece sizes
///
/// Sizes come from the payload's length, so `policy.chunk_sizes` is filled in.
pub fn init_file<C: Coder + ?Sized>(dir: &Path, policy: &mut Policy, coder: &C) -> Result<()> {
    let size = fs::metadata(dir.join(DATA_FILE))?.len() as f64;
    policy.compute_chunk_sizes(size);
    encode_unit(dir, policy, 0, coder)?;
    policy.write_chunk_sizes(dir)?;
    info!(dir = %dir.display(), size, policy = %policy.description, "file encoded");
    Ok(())
}

fn encode_unit<C: Coder + ?Sized>(
    dir: &Path,
    policy: &Policy,
    level: usize,
    coder: &C,
) -> Result<()> {
    let Some(coding) = policy.codings.get(level) else {
        return Ok(());
    };
    coder.encode(dir, coding)?;
    for i in 0..coding.m {
        let child = dir.join(format!("data.{}", i));
        fs::create_dir_all(&child)?;
        let target = Path::new("..").join(CODING_DIR).join(piece_file_name(coding, i));
        link_payload(&child, &target)?;
        encode_unit(&child, policy, level + 1, coder)?;
    }
    Ok(())
}

/// Rebuild the tree of a file from disk plus its placement records
pub fn get_state(
    dir: &Path,
    mut policy: Policy,
    placements: &[PlacementRecord],
) -> Result<CodingTree> {
    policy.read_chunk_sizes(dir)?;
    let mut tree = CodingTree::build(policy);

    for id in tree.chunk_ids() {
        let present = unit_dir(dir, &tree.unit(id).path).join(DATA_FILE).exists();
        tree.chunk_mut(id)?.present_on_server = present;
    }
    for record in placements {
        let placement: Placement = record.to_placement();
        match tree.add_placement(&record.name, placement) {
            Ok(true) => {}
            Ok(false) => warn!(chunk = %record.name, host = record.host_id, "duplicate placement"),
            Err(e) => warn!(chunk = %record.name, error = %e, "placement for unknown chunk"),
        }
    }
    Ok(tree)
}

/// Delete the server copy of the unit at `path`
pub fn delete_server_copy(file_dir: &Path, path: &[usize]) -> Result<()> {
    let link_path = unit_dir(file_dir, path).join(DATA_FILE);
    match fs::canonicalize(&link_path) {
        Ok(target) => fs::remove_file(target)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Regenerate every piece of the meta-chunk at `path`
///
/// Decodes first unless the meta-chunk's own data is already on disk.
pub fn reconstruct<C: Coder + ?Sized>(
    file_dir: &Path,
    path: &[usize],
    coding: &Coding,
    coder: &C,
) -> Result<()> {
    let dir = unit_dir(file_dir, path);
    if !dir.join(DATA_FILE).exists() {
        coder.decode(&dir, coding)?;
    }
    coder.encode(&dir, coding)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::Status;

    /// In-process coder: every piece is a copy of the payload
    pub(crate) struct CopyCoder;

    impl Coder for CopyCoder {
        fn encode(&self, dir: &Path, coding: &Coding) -> Result<()> {
            let data = fs::read(dir.join(DATA_FILE))?;
            fs::create_dir_all(dir.join(CODING_DIR))?;
            for i in 0..coding.m {
                fs::write(dir.join(CODING_DIR).join(piece_file_name(coding, i)), &data)?;
            }
            Ok(())
        }

        fn decode(&self, dir: &Path, coding: &Coding) -> Result<()> {
            for i in 0..coding.m {
                let piece = dir.join(CODING_DIR).join(piece_file_name(coding, i));
                if piece.exists() {
                    fs::copy(piece, dir.join(DATA_FILE))?;
                    return Ok(());
                }
            }
            Err(VdaError::NotFound(format!("pieces under {}", dir.display())))
        }
    }

    /// File directory holding a `size`-byte payload
    pub(crate) fn payload_dir(root: &Path, size: usize) -> PathBuf {
        let dir = root.join("file");
        fs::create_dir_all(&dir).unwrap();
        fs::write(root.join("payload.bin"), vec![7u8; size]).unwrap();
        link_payload(&dir, &root.join("payload.bin")).unwrap();
        dir
    }

    #[test]
    fn test_piece_names() {
        let coding = Coding::new(10, 6, 12).unwrap();
        assert_eq!(piece_file_name(&coding, 0), "data_k01.vda");
        assert_eq!(piece_file_name(&coding, 9), "data_k10.vda");
        assert_eq!(piece_file_name(&coding, 10), "data_m01.vda");
        assert_eq!(piece_file_name(&coding, 15), "data_m06.vda");
        assert_eq!(
            unit_dir(Path::new("/a"), &[3, 1]),
            PathBuf::from("/a/data.3/data.1")
        );
    }

    #[test]
    fn test_init_and_get_state() {
        let root = tempfile::tempdir().unwrap();
        let dir = payload_dir(root.path(), 6000);
        let mut policy = Policy::parse("2 2 2 1 3 1 1 2").unwrap();

        init_file(&dir, &mut policy, &CopyCoder).unwrap();
        assert_eq!(policy.chunk_sizes, vec![3000.0, 3000.0]);
        assert!(dir.join("data.2/data.1/data.vda").exists());

        let placements = vec![
            PlacementRecord::downloading(1, 5, "0.0"),
            PlacementRecord::downloading(1, 6, "9.9"),
        ];
        let fresh = Policy::parse("2 2 2 1 3 1 1 2").unwrap();
        let tree = get_state(&dir, fresh, &placements).unwrap();
        assert_eq!(tree.chunk_ids().len(), 6);
        for id in tree.chunk_ids() {
            assert!(tree.chunk(id).unwrap().present_on_server);
        }
        let chunk = tree.chunk(tree.find("0.0").unwrap()).unwrap();
        assert!(chunk.is_on_host(5));
        assert_eq!(tree.status(), Status::Unrecoverable);
    }

    #[test]
    fn test_delete_and_reconstruct() {
        let root = tempfile::tempdir().unwrap();
        let dir = payload_dir(root.path(), 100);
        let mut policy = Policy::parse("1 1 2 1 3").unwrap();
        init_file(&dir, &mut policy, &CopyCoder).unwrap();

        delete_server_copy(&dir, &[0]).unwrap();
        delete_server_copy(&dir, &[2]).unwrap();
        delete_server_copy(&dir, &[2]).unwrap();
        assert!(!dir.join("data.0/data.vda").exists());
        assert!(fs::symlink_metadata(dir.join("data.0/data.vda")).is_ok());

        reconstruct(&dir, &[], &policy.codings[0], &CopyCoder).unwrap();
        assert!(dir.join("data.0/data.vda").exists());
        assert!(dir.join("data.2/data.vda").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_external_coder_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let coding = Coding::new(2, 1, 3).unwrap();

        let ok = ExternalCoder::new(Path::new("true"), Path::new("true"));
        assert!(ok.encode(dir.path(), &coding).is_ok());

        let failing = ExternalCoder::new(Path::new("false"), Path::new("false"));
        match failing.decode(dir.path(), &coding) {
            Err(VdaError::Subprocess { status, .. }) => assert_eq!(status, 1),
            other => panic!("expected subprocess error, got {:?}", other),
        }
    }
}
