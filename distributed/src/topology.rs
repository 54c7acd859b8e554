//! Resolution of a worker's identity and device from the launch environment.
//!
//! The launcher describes the group with `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT`,
//! optionally `LOCAL_RANK`, `LOCAL_WORLD_SIZE` and `VISIBLE_DEVICES`. Resolution is pure: it reads
//! a `LaunchEnv` snapshot and either returns a `Topology` or a `DistErr::Topology`.

use std::{
    collections::HashMap,
    env,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    thread,
};

use crate::error::{DistErr, Result};

const RANK: &str = "RANK";
const WORLD_SIZE: &str = "WORLD_SIZE";
const LOCAL_RANK: &str = "LOCAL_RANK";
const LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";
const MASTER_ADDR: &str = "MASTER_ADDR";
const MASTER_PORT: &str = "MASTER_PORT";
const VISIBLE_DEVICES: &str = "VISIBLE_DEVICES";

const KEYS: [&str; 7] = [
    RANK,
    WORLD_SIZE,
    LOCAL_RANK,
    LOCAL_WORLD_SIZE,
    MASTER_ADDR,
    MASTER_PORT,
    VISIBLE_DEVICES,
];

/// A snapshot of the launch time key value pairs.
#[derive(Debug, Clone, Default)]
pub struct LaunchEnv {
    vars: HashMap<String, String>,
}

impl LaunchEnv {
    /// Captures the recognised keys from the process environment.
    pub fn from_process() -> Self {
        Self {
            vars: env::vars()
                .filter(|(k, _)| KEYS.contains(&k.as_str()))
                .collect(),
        }
    }

    /// Builds a snapshot from explicit pairs.
    ///
    /// # Arguments
    /// * `pairs` - The key value pairs, later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn optional<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.vars.get(key) else {
            return Ok(None);
        };

        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| DistErr::topology(format!("{key}={raw:?} is not a valid value")))
    }

    fn required<T: FromStr>(&self, key: &str) -> Result<T> {
        self.optional(key)?
            .ok_or_else(|| DistErr::topology(format!("{key} is not set")))
    }
}

/// Who this worker is within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
}

/// A compute device on the host, identified by its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub ordinal: usize,
}

/// The device a worker is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBinding {
    pub local_rank: usize,
    pub device: Device,
}

/// Everything the group needs to know about this worker before it can rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub identity: WorkerIdentity,
    pub binding: DeviceBinding,
    pub rendezvous: SocketAddr,
}

/// Resolves the worker's identity, device binding and rendezvous address.
///
/// `local_rank` is `LOCAL_RANK` when set, otherwise `RANK % LOCAL_WORLD_SIZE` when the node size
/// is known, otherwise `RANK` (single node). Local rank `i` binds to the `i`-th visible device.
///
/// # Arguments
/// * `env` - The launch environment snapshot.
///
/// # Errors
/// `DistErr::Topology` if a required key is missing, a value doesn't parse or the values are
/// inconsistent with each other or with the devices available on the host.
pub fn resolve(env: &LaunchEnv) -> Result<Topology> {
    let rank: usize = env.required(RANK)?;
    let world_size: usize = env.required(WORLD_SIZE)?;

    if world_size == 0 {
        return Err(DistErr::topology("WORLD_SIZE must be at least 1"));
    }

    if rank >= world_size {
        return Err(DistErr::topology(format!(
            "RANK {rank} is out of range for WORLD_SIZE {world_size}"
        )));
    }

    let local_world_size: Option<usize> = env.optional(LOCAL_WORLD_SIZE)?;
    let local_rank = match (env.optional::<usize>(LOCAL_RANK)?, local_world_size) {
        (_, Some(0)) => return Err(DistErr::topology("LOCAL_WORLD_SIZE must be at least 1")),
        (Some(local_rank), Some(lws)) if local_rank >= lws => {
            return Err(DistErr::topology(format!(
                "LOCAL_RANK {local_rank} is out of range for LOCAL_WORLD_SIZE {lws}"
            )));
        }
        (Some(local_rank), _) => local_rank,
        (None, Some(lws)) => rank % lws,
        (None, None) => rank,
    };

    let devices = visible_devices(env)?;
    let Some(&ordinal) = devices.get(local_rank) else {
        return Err(DistErr::topology(format!(
            "local rank {local_rank} has no device, only {} available",
            devices.len()
        )));
    };

    let addr: String = env.required(MASTER_ADDR)?;
    let port: u16 = env.required(MASTER_PORT)?;
    let rendezvous = (addr.as_str(), port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| DistErr::topology(format!("can't resolve {addr}:{port}")))?;

    Ok(Topology {
        identity: WorkerIdentity {
            rank,
            world_size,
            local_rank,
        },
        binding: DeviceBinding {
            local_rank,
            device: Device { ordinal },
        },
        rendezvous,
    })
}

/// Returns the device ordinals this process may use, in binding order.
fn visible_devices(env: &LaunchEnv) -> Result<Vec<usize>> {
    let Some(raw) = env.vars.get(VISIBLE_DEVICES) else {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        return Ok((0..cores).collect());
    };

    let mut devices = Vec::new();

    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let ordinal = part.parse().map_err(|_| {
            DistErr::topology(format!("{VISIBLE_DEVICES} entry {part:?} is not an ordinal"))
        })?;

        if devices.contains(&ordinal) {
            return Err(DistErr::topology(format!(
                "device {ordinal} is listed twice in {VISIBLE_DEVICES}"
            )));
        }

        devices.push(ordinal);
    }

    Ok(devices)
}
