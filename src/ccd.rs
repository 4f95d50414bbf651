// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-identity network policy (client-config-dir files).
//!
//! Each identity may own one file in the CCD directory, consumed by the VPN
//! daemon when that identity connects:
//!
//! ```text
//! ifconfig-push 172.16.100.50 255.255.255.0
//! push "route 10.10.0.0 255.255.0.0" # office
//! ```
//!
//! # Lifecycle
//!
//! - Reading an absent file yields the default entry (dynamic address, no
//!   routes) and creates nothing.
//! - [`CcdStore::apply`] validates first and only then overwrites the file
//!   wholesale. A rejected entry leaves the directory untouched.
//! - Files are never deleted.
//!
//! # Validation order
//!
//! Static address: taken by another entry, then IP syntax, then subnet
//! membership. Then every route: address syntax, mask syntax. The first
//! failure is reported.

use crate::error::{ControlPlaneError, Result};
use crate::registry::validate_identity;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Client address sentinel: let the daemon pick from its pool.
pub const DYNAMIC_ADDRESS: &str = "dynamic";

/// One pushed route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CcdRoute {
    pub address: String,
    pub mask: String,
    #[serde(default)]
    pub description: String,
}

/// Policy for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CcdEntry {
    pub user: String,
    /// [`DYNAMIC_ADDRESS`] or a static IP.
    pub client_address: String,
    #[serde(default)]
    pub custom_routes: Vec<CcdRoute>,
}

impl CcdEntry {
    /// Entry used when no file exists.
    pub fn dynamic(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            client_address: DYNAMIC_ADDRESS.to_string(),
            custom_routes: Vec::new(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.client_address == DYNAMIC_ADDRESS
    }
}

/// Why an entry was rejected. Messages are shown to users verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CcdRejection {
    #[error("ClientAddress \"{address}\" already assigned to another user")]
    AddressTaken { address: String },

    #[error("ClientAddress \"{address}\" not a valid IP address")]
    InvalidAddress { address: String },

    #[error("ClientAddress \"{address}\" not belongs to openvpn server network")]
    OutsideNetwork { address: String },

    #[error("CustomRoute.Address \"{address}\" must be a valid IP address")]
    InvalidRouteAddress { address: String },

    #[error("CustomRoute.Mask \"{mask}\" must be a valid IP address")]
    InvalidRouteMask { mask: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subnet
// ═══════════════════════════════════════════════════════════════════════════════

/// A CIDR network, e.g. `172.16.100.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix: u8) -> std::result::Result<Self, String> {
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(format!("prefix /{} exceeds /{}", prefix, max));
        }
        Ok(Self {
            network: mask_addr(&addr, prefix),
            prefix,
        })
    }

    /// Network address (host bits cleared).
    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Does the network contain `addr`? Families never mix.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        if addr.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask_addr(addr, self.prefix) == self.network
    }

    /// Dotted netmask for the prefix (`/24` → `255.255.255.0`).
    pub fn netmask(&self) -> IpAddr {
        match self.network {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(v4_mask(self.prefix))),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(v6_mask(self.prefix))),
        }
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("\"{}\" is not in CIDR notation", s))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("\"{}\" is not a valid IP address", addr))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("\"{}\" is not a valid prefix length", prefix))?;
        Subnet::new(addr, prefix)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

fn mask_addr(addr: &IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(*v4) & v4_mask(prefix))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(*v6) & v6_mask(prefix))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parse / validate / render
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse a policy file. Never fails; unrecognized lines are ignored.
pub fn parse(user: &str, text: &str) -> CcdEntry {
    let mut entry = CcdEntry::dynamic(user);

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["ifconfig-push", address, ..] => {
                entry.client_address = address.to_string();
            }
            ["push", directive, address, mask, rest @ ..]
                if directive.trim_matches('"') == "route" =>
            {
                let description = rest.join(" ");
                entry.custom_routes.push(CcdRoute {
                    address: address.trim_matches('"').to_string(),
                    mask: mask.trim_matches('"').to_string(),
                    description: description.trim_start_matches('#').trim().to_string(),
                });
            }
            _ => {}
        }
    }

    entry
}

/// Validate `entry` against the other stored entries and the VPN subnet.
///
/// Entries in `existing` belonging to `entry.user` are ignored.
pub fn validate(
    entry: &CcdEntry,
    existing: &[CcdEntry],
    subnet: &Subnet,
) -> std::result::Result<(), CcdRejection> {
    if !entry.is_dynamic() {
        let address = entry.client_address.as_str();

        if existing
            .iter()
            .any(|other| other.user != entry.user && other.client_address == address)
        {
            return Err(CcdRejection::AddressTaken {
                address: address.to_string(),
            });
        }

        let ip: IpAddr = address.parse().map_err(|_| CcdRejection::InvalidAddress {
            address: address.to_string(),
        })?;

        if !subnet.contains(&ip) {
            return Err(CcdRejection::OutsideNetwork {
                address: address.to_string(),
            });
        }
    }

    for route in &entry.custom_routes {
        if route.address.parse::<IpAddr>().is_err() {
            return Err(CcdRejection::InvalidRouteAddress {
                address: route.address.clone(),
            });
        }
        if route.mask.parse::<IpAddr>().is_err() {
            return Err(CcdRejection::InvalidRouteMask {
                mask: route.mask.clone(),
            });
        }
    }

    Ok(())
}

/// Render an entry as a policy file.
pub fn render(entry: &CcdEntry, subnet: &Subnet) -> String {
    let mut out = String::new();

    if !entry.is_dynamic() {
        out.push_str(&format!(
            "ifconfig-push {} {}\n",
            entry.client_address,
            subnet.netmask()
        ));
    }

    for route in &entry.custom_routes {
        if route.description.is_empty() {
            out.push_str(&format!("push \"route {} {}\"\n", route.address, route.mask));
        } else {
            out.push_str(&format!(
                "push \"route {} {}\" # {}\n",
                route.address, route.mask, route.description
            ));
        }
    }

    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// CcdStore
// ═══════════════════════════════════════════════════════════════════════════════

/// The policy directory.
#[derive(Debug, Clone)]
pub struct CcdStore {
    dir: PathBuf,
    subnet: Subnet,
}

impl CcdStore {
    pub fn new(dir: impl Into<PathBuf>, subnet: Subnet) -> Self {
        Self {
            dir: dir.into(),
            subnet,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    fn path_for(&self, user: &str) -> Result<PathBuf> {
        validate_identity(user)?;
        Ok(self.dir.join(user))
    }

    /// Read the entry for `user`; the default entry if no file exists.
    pub async fn load(&self, user: &str) -> Result<CcdEntry> {
        let path = self.path_for(user)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(parse(user, &text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CcdEntry::dynamic(user)),
            Err(e) => Err(ControlPlaneError::io(path.display().to_string(), e)),
        }
    }

    /// Every stored entry except `user`'s.
    ///
    /// A missing directory has no entries. Files whose names are not valid
    /// identities are skipped.
    pub async fn load_all_except(&self, user: &str) -> Result<Vec<CcdEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ControlPlaneError::io(self.dir.display().to_string(), e)),
        };

        let mut entries = Vec::new();
        loop {
            let next = dir
                .next_entry()
                .await
                .map_err(|e| ControlPlaneError::io(self.dir.display().to_string(), e))?;
            let Some(file) = next else {
                break;
            };

            let name = file.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == user || name.starts_with('.') || validate_identity(name).is_err() {
                continue;
            }
            match file.file_type().await {
                Ok(kind) if kind.is_file() => {}
                _ => continue,
            }

            match tokio::fs::read_to_string(file.path()).await {
                Ok(text) => entries.push(parse(name, &text)),
                Err(e) => {
                    warn!(file = %file.path().display(), error = %e, "Skipping unreadable policy file");
                }
            }
        }

        Ok(entries)
    }

    /// Validate `entry` and, if accepted, overwrite its file.
    pub async fn apply(&self, entry: &CcdEntry) -> Result<()> {
        let path = self.path_for(&entry.user)?;
        let existing = self.load_all_except(&entry.user).await?;

        if let Err(rejection) = validate(entry, &existing, &self.subnet) {
            debug!(user = %entry.user, reason = %rejection, "Policy rejected");
            return Err(rejection.into());
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ControlPlaneError::io(self.dir.display().to_string(), e))?;

        let tmp = self.dir.join(format!(".{}.tmp", entry.user));
        tokio::fs::write(&tmp, render(entry, &self.subnet))
            .await
            .map_err(|e| ControlPlaneError::io(tmp.display().to_string(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ControlPlaneError::io(path.display().to_string(), e))?;

        info!(
            user = %entry.user,
            address = %entry.client_address,
            routes = entry.custom_routes.len(),
            "Policy updated"
        );
        Ok(())
    }
}
