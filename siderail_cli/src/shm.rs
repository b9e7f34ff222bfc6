use libafl_bolts::shmem::{ShMem, ShMemProvider, StdShMemProvider};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("Failed to create shared memory segment: {0}")]
    Create(#[source] libafl_bolts::Error),
    #[error("Failed to publish shared memory segment {id} as {name}: {source}")]
    Export {
        id: String,
        name: String,
        #[source]
        source: libafl_bolts::Error,
    },
}

/// The coverage segment the target attaches to through `__AFL_SHM_ID`.
///
/// Removed by the provider's shmem when this value is dropped.
#[derive(Debug)]
pub struct SharedMap {
    shmem: <StdShMemProvider as ShMemProvider>::ShMem,
}

impl SharedMap {
    pub fn new(len: usize) -> Result<Self, ShmError> {
        let mut provider = StdShMemProvider::new().map_err(ShmError::Create)?;
        let shmem = provider.new_shmem(len).map_err(ShmError::Create)?;
        let mut map = Self { shmem };
        map.clear();
        Ok(map)
    }

    /// The id a target passes to `shmat`.
    pub fn id(&self) -> String {
        self.shmem.id().to_string()
    }

    /// Publishes the segment id (and its size) in this process's environment.
    pub fn write_to_env(&self, name: &str) -> Result<(), ShmError> {
        // SAFETY: std serialises its own environment accesses, and nothing in
        // the driver reads the environment through libc.
        #[allow(unused_unsafe)]
        let exported = unsafe { self.shmem.write_to_env(name) };
        exported.map_err(|source| ShmError::Export {
            id: self.id(),
            name: name.to_string(),
            source,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.shmem[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.shmem[..]
    }

    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}
