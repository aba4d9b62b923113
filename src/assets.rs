//! Sound assets: `<name>.p3` files holding back to back `BinaryProtocol3`
//! frames of 16kHz / 60ms Opus.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub const SOUND_POPUP: &str = "popup";
pub const SOUND_SUCCESS: &str = "success";
pub const SOUND_EXCLAMATION: &str = "exclamation";
pub const SOUND_VIBRATION: &str = "vibration";

pub struct SoundAssets {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<[u8]>>>,
}

impl SoundAssets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Framed Opus data for `name`. Files are read once and cached.
    pub fn load(&self, name: &str) -> Result<Arc<[u8]>> {
        if let Some(data) = self.cache.lock().get(name) {
            return Ok(data.clone());
        }
        let path = self.dir.join(format!("{}.p3", name));
        let data: Arc<[u8]> = fs::read(&path)
            .with_context(|| format!("Failed to read sound {}", path.display()))?
            .into();
        self.cache.lock().insert(name.to_string(), data.clone());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{allocate_binary_protocol3, parse_binary_protocol3_stream};

    #[test]
    fn loads_and_caches_framed_sounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = allocate_binary_protocol3(0, &[1, 2, 3]).unwrap().to_vec();
        data.extend_from_slice(&allocate_binary_protocol3(0, &[4, 5]).unwrap());
        fs::write(dir.path().join("popup.p3"), &data).unwrap();

        let assets = SoundAssets::new(dir.path());
        let sound = assets.load(SOUND_POPUP).unwrap();
        assert_eq!(parse_binary_protocol3_stream(&sound).count(), 2);

        fs::remove_file(dir.path().join("popup.p3")).unwrap();
        assert_eq!(&*assets.load(SOUND_POPUP).unwrap(), &data[..]);
        assert!(assets.load(SOUND_VIBRATION).is_err());
    }
}
