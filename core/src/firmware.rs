//! Firmware images on the host side: loading, build metadata, and the cache
//! of previously flashed images used as delta bases.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use nom::{
    bytes::complete::tag,
    character::complete::{digit1, space0, space1},
    IResult, Parser,
};

use crate::delta::FirmwareCache;
use crate::models::FirmwareImage;

/// Generated headers that may carry the build number, relative to the
/// project root.
const GIT_INFO_HEADERS: [&str; 2] = ["include/git_info.h", "src/config/git_info.h"];

/// Build output directory name; the project root is its parent.
const BUILD_DIR: &str = ".pio";

fn build_define(input: &str) -> IResult<&str, &str> {
    let (input, _) = space0(input)?;
    let (input, _) = tag("#define").parse(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("BUILD_NUMBER").parse(input)?;
    let (input, _) = space1(input)?;
    digit1(input)
}

/// Extract `<n>` from a `#define BUILD_NUMBER <n>` line.
pub fn build_number_from_git_info(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| build_define(line).ok().map(|(_, digits)| digits.to_string()))
}

/// Locate the build number for a firmware binary inside a build tree.
pub fn find_build_number(firmware_path: &Path) -> Option<String> {
    let build_dir = firmware_path
        .ancestors()
        .find(|dir| dir.file_name().is_some_and(|name| name == BUILD_DIR))?;
    let project_dir = build_dir.parent()?;
    GIT_INFO_HEADERS.iter().find_map(|header| {
        let contents = fs::read_to_string(project_dir.join(header)).ok()?;
        build_number_from_git_info(&contents)
    })
}

/// Read a firmware binary and, if it sits in a build tree, its build number.
pub fn load_firmware(path: &Path) -> io::Result<FirmwareImage> {
    let bytes = fs::read(path)?;
    let build = find_build_number(path);
    debug!(
        "loaded firmware {} ({} bytes, build {:?})",
        path.display(),
        bytes.len(),
        build
    );
    Ok(FirmwareImage::new(bytes, build))
}

/// Previously flashed images stored as `build_<NNN>.bin`.
#[derive(Clone, Debug)]
pub struct DirectoryFirmwareCache {
    dir: PathBuf,
}

impl DirectoryFirmwareCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, build: &str) -> Option<PathBuf> {
        let number: u32 = build.trim().parse().ok()?;
        Some(self.dir.join(format!("build_{number:03}.bin")))
    }

    /// Store an image so later updates can diff against it.
    pub fn store(&self, build: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(build).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("build number {build:?} is not numeric"),
            )
        })?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

impl FirmwareCache for DirectoryFirmwareCache {
    fn lookup(&self, build: &str) -> Option<Vec<u8>> {
        let path = self.path_for(build)?;
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("no cached firmware at {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("grinder-link-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_build_number_from_git_info() {
        let header = "#pragma once\n#define GIT_HASH \"abc123\"\n#define BUILD_NUMBER 142\n";
        assert_eq!(build_number_from_git_info(header), Some("142".to_string()));
        assert_eq!(build_number_from_git_info("  #define  BUILD_NUMBER\t7"), Some("7".to_string()));
        assert_eq!(build_number_from_git_info("#define BUILD_NUMBER_X 3"), None);
        assert_eq!(build_number_from_git_info(""), None);
    }

    #[test]
    fn test_cache_path_padding() {
        let cache = DirectoryFirmwareCache::new("/cache");
        assert_eq!(
            cache.path_for("7"),
            Some(PathBuf::from("/cache/build_007.bin"))
        );
        assert_eq!(
            cache.path_for("1234"),
            Some(PathBuf::from("/cache/build_1234.bin"))
        );
        assert_eq!(cache.path_for("dev"), None);
    }

    #[test]
    fn test_cache_store_and_lookup() {
        let dir = scratch_dir();
        let cache = DirectoryFirmwareCache::new(&dir);
        assert_eq!(cache.lookup("12"), None);

        cache.store("12", &[1, 2, 3]).unwrap();
        assert_eq!(cache.lookup("12"), Some(vec![1, 2, 3]));
        assert!(cache.store("abc", &[1]).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_firmware_from_build_tree() {
        let root = scratch_dir();
        let out = root.join(".pio/build/board");
        fs::create_dir_all(&out).unwrap();
        fs::create_dir_all(root.join("include")).unwrap();
        fs::write(root.join("include/git_info.h"), "#define BUILD_NUMBER 88\n").unwrap();
        fs::write(out.join("firmware.bin"), [0xE9u8; 32]).unwrap();

        let image = load_firmware(&out.join("firmware.bin")).unwrap();
        assert_eq!(image.len(), 32);
        assert_eq!(image.build.as_deref(), Some("88"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_load_firmware_outside_build_tree() {
        let root = scratch_dir();
        fs::write(root.join("firmware.bin"), [0u8; 4]).unwrap();
        let image = load_firmware(&root.join("firmware.bin")).unwrap();
        assert_eq!(image.build, None);
        fs::remove_dir_all(&root).unwrap();
    }
}
