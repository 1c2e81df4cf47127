//! Deterministic port and workspace assignment.
//!
//! A run's home slot is derived from a hash of its id; collisions with other
//! live runs are resolved by linear probing. Check-and-reserve happens under
//! the registry lock so concurrent allocations can never overlap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::AllocatorConfig;
use crate::error::{PilotError, Result};
use crate::registry::{Reservation, RunRegistry};
use crate::utils::path_component;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ports {
    pub primary: u16,
    pub secondary: u16,
}

impl Ports {
    pub fn contains(&self, port: u16) -> bool {
        self.primary == port || self.secondary == port
    }

    pub fn overlaps(&self, other: &Ports) -> bool {
        self.contains(other.primary) || self.contains(other.secondary)
    }
}

impl std::fmt::Display for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.primary, self.secondary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub ports: Ports,
    pub workspace_path: PathBuf,
}

impl Allocation {
    pub fn conflicts_with(&self, other: &Allocation) -> bool {
        self.ports.overlaps(&other.ports) || self.workspace_path == other.workspace_path
    }
}

pub struct ResourceAllocator {
    registry: Arc<RunRegistry>,
    workspaces_dir: PathBuf,
    port_base: u16,
    slot_count: u16,
    max_probes: u32,
}

impl ResourceAllocator {
    pub fn new(registry: Arc<RunRegistry>, workspaces_dir: &Path, config: &AllocatorConfig) -> Self {
        Self {
            registry,
            workspaces_dir: workspaces_dir.to_path_buf(),
            port_base: config.port_base,
            slot_count: config.slot_count.max(1),
            max_probes: config.max_probes,
        }
    }

    /// Reserve a port pair and workspace path for `run_id`.
    ///
    /// Idempotent: a run that already holds an allocation gets it back unchanged.
    pub fn allocate(&self, run_id: &str) -> Result<Allocation> {
        if let Some(existing) = self.registry.allocation(run_id) {
            debug!(run_id, ports = %existing.ports, "Run already holds an allocation");
            return Ok(existing);
        }

        let home = self.home_slot(run_id);
        let probes = self.max_probes.min(u32::from(self.slot_count));

        for probe in 0..probes {
            let slot = ((u32::from(home) + probe) % u32::from(self.slot_count)) as u16;
            let candidate = self.candidate(run_id, slot, probe);
            if candidate.workspace_path.exists() {
                debug!(run_id, slot, path = %candidate.workspace_path.display(), "Stale workspace on disk, probing next slot");
                continue;
            }

            match self.registry.try_reserve(run_id, &candidate) {
                Reservation::Reserved => {
                    info!(
                        run_id,
                        ports = %candidate.ports,
                        path = %candidate.workspace_path.display(),
                        probe,
                        "Allocated run resources"
                    );
                    return Ok(candidate);
                }
                Reservation::Existing(existing) => {
                    debug!(run_id, ports = %existing.ports, "Run already holds an allocation");
                    return Ok(existing);
                }
                Reservation::Conflict => {
                    debug!(run_id, slot, "Allocation collision, probing next slot");
                }
            }
        }

        warn!(run_id, probes, "Resource allocation exhausted");
        Err(PilotError::ResourceExhausted {
            run_id: run_id.to_string(),
            probes,
        })
    }

    /// Re-reserve exactly the allocation a persisted run already owns.
    pub fn reclaim(&self, run_id: &str, allocation: &Allocation) -> Result<Allocation> {
        match self.registry.try_reserve(run_id, allocation) {
            Reservation::Reserved => Ok(allocation.clone()),
            Reservation::Existing(existing) if existing == *allocation => Ok(existing),
            Reservation::Existing(_) => Err(PilotError::AllocationImmutable {
                run_id: run_id.to_string(),
            }),
            Reservation::Conflict => Err(PilotError::ResourceExhausted {
                run_id: run_id.to_string(),
                probes: 0,
            }),
        }
    }

    /// Release the run's allocation. Releasing twice, or an unknown run, is a no-op.
    pub fn release(&self, run_id: &str) -> Option<Allocation> {
        let released = self.registry.release(run_id);
        if let Some(allocation) = &released {
            info!(run_id, ports = %allocation.ports, "Released run resources");
        }
        released
    }

    fn home_slot(&self, run_id: &str) -> u16 {
        let digest = Sha256::digest(run_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % u64::from(self.slot_count)) as u16
    }

    fn candidate(&self, run_id: &str, slot: u16, probe: u32) -> Allocation {
        let primary = self.port_base + 2 * slot;
        let dir_name = if probe == 0 {
            path_component(run_id)
        } else {
            format!("{}-{}", path_component(run_id), probe)
        };

        Allocation {
            ports: Ports {
                primary,
                secondary: primary + 1,
            },
            workspace_path: self.workspaces_dir.join(dir_name),
        }
    }
}
