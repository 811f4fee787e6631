// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flat guest image loading.

use anyhow::Context as _;
use anyhow::bail;
use std::path::Path;

/// Reads the image in full and copies it to guest physical address 0.
///
/// The caller sizes guest memory so the image and the reserved low
/// page-table region do not corrupt each other; that is a configuration
/// contract, not a runtime check. An image that does not fit in guest
/// memory at all is rejected.
pub fn load_image(path: &Path, memory: &mut [u8]) -> anyhow::Result<usize> {
    let image = std::fs::read(path)
        .with_context(|| format!("failed to read guest image `{}`", path.display()))?;
    if image.len() > memory.len() {
        bail!(
            "guest image `{}` is {} bytes but guest memory is only {} bytes",
            path.display(),
            image.len(),
            memory.len()
        );
    }
    memory[..image.len()].copy_from_slice(&image);
    Ok(image.len())
}

#[cfg(test)]
mod tests {
    use super::load_image;

    #[test]
    fn copies_image_to_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.img");
        std::fs::write(&path, b"\x90\x90\xf4").unwrap();

        let mut memory = vec![0u8; 0x1000];
        let loaded = load_image(&path, &mut memory).unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(&memory[..3], b"\x90\x90\xf4");
        assert!(memory[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_oversized_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.img");
        std::fs::write(&path, vec![0u8; 0x2000]).unwrap();

        let mut memory = vec![0u8; 0x1000];
        assert!(load_image(&path, &mut memory).is_err());
    }

    #[test]
    fn missing_image_is_an_error() {
        let mut memory = vec![0u8; 0x1000];
        assert!(load_image("no-such-image.img".as_ref(), &mut memory).is_err());
    }
}
