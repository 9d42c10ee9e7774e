use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capacity::{Capacity, GIB, MIB};

/// Smallest memory a VM may request.
pub const MIN_VM_MEMORY: u64 = 256 * MIB;
pub const MAX_VM_CPU: u8 = 32;

/// Fixed overhead a QSFS workload reserves on top of its cache.
const QSFS_CRU: u64 = 1;
const QSFS_MRU: u64 = GIB;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadType {
    Vm,
    Disk,
    Zdb,
    Qsfs,
    GatewayName,
    GatewayFqdn,
    Network,
    PublicIp,
    LogShipper,
}

impl WorkloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Vm => "vm",
            WorkloadType::Disk => "disk",
            WorkloadType::Zdb => "zdb",
            WorkloadType::Qsfs => "qsfs",
            WorkloadType::GatewayName => "gateway-name",
            WorkloadType::GatewayFqdn => "gateway-fqdn",
            WorkloadType::Network => "network",
            WorkloadType::PublicIp => "public-ip",
            WorkloadType::LogShipper => "log-shipper",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State a node reports for a workload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    #[default]
    Unset,
    Ok,
    Error,
    Deleted,
    Paused,
    Unchanged,
}

impl ResultState {
    /// States that end a convergence wait with a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ResultState::Error | ResultState::Deleted | ResultState::Paused | ResultState::Unchanged
        )
    }
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultState::Unset => "unset",
            ResultState::Ok => "ok",
            ResultState::Error => "error",
            ResultState::Deleted => "deleted",
            ResultState::Paused => "paused",
            ResultState::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadResult {
    pub state: ResultState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmMount {
    /// Name of a disk workload in the same deployment.
    pub disk: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmData {
    pub flist: String,
    #[serde(default)]
    pub entrypoint: String,
    pub cpu: u8,
    /// Memory in bytes.
    pub memory: u64,
    /// Root filesystem size in bytes; 0 lets the node pick its default.
    #[serde(default)]
    pub rootfs_size: u64,
    /// Name of the network workload the VM joins.
    pub network: String,
    pub ip: String,
    /// Name of a public IP workload in the same deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub planetary: bool,
    #[serde(default)]
    pub corex: bool,
    #[serde(default)]
    pub mounts: Vec<VmMount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskData {
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ZdbMode {
    Seq,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZdbData {
    pub size: u64,
    pub mode: ZdbMode,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QsfsData {
    /// Local cache size in bytes.
    pub cache: u64,
    pub minimal_shards: u32,
    pub expected_shards: u32,
    pub metadata_endpoint: String,
    #[serde(default)]
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayNameData {
    pub name: String,
    pub backends: Vec<String>,
    #[serde(default)]
    pub tls_passthrough: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayFqdnData {
    pub fqdn: String,
    pub backends: Vec<String>,
    #[serde(default)]
    pub tls_passthrough: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkPeer {
    pub subnet: String,
    pub wireguard_public_key: String,
    #[serde(default)]
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkData {
    pub ip_range: String,
    pub subnet: String,
    pub wireguard_private_key: String,
    pub wireguard_listen_port: u16,
    #[serde(default)]
    pub peers: Vec<NetworkPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicIpData {
    pub v4: bool,
    pub v6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogShipperData {
    /// Name of the VM workload whose logs are shipped.
    pub vm: String,
    pub destinations: Vec<String>,
}

/// Typed payload of a workload. The serialised form is what nodes receive and
/// what content hashes are computed over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum WorkloadData {
    Vm(VmData),
    Disk(DiskData),
    Zdb(ZdbData),
    Qsfs(QsfsData),
    GatewayName(GatewayNameData),
    GatewayFqdn(GatewayFqdnData),
    Network(NetworkData),
    PublicIp(PublicIpData),
    LogShipper(LogShipperData),
}

impl WorkloadData {
    pub fn workload_type(&self) -> WorkloadType {
        match self {
            WorkloadData::Vm(_) => WorkloadType::Vm,
            WorkloadData::Disk(_) => WorkloadType::Disk,
            WorkloadData::Zdb(_) => WorkloadType::Zdb,
            WorkloadData::Qsfs(_) => WorkloadType::Qsfs,
            WorkloadData::GatewayName(_) => WorkloadType::GatewayName,
            WorkloadData::GatewayFqdn(_) => WorkloadType::GatewayFqdn,
            WorkloadData::Network(_) => WorkloadType::Network,
            WorkloadData::PublicIp(_) => WorkloadType::PublicIp,
            WorkloadData::LogShipper(_) => WorkloadType::LogShipper,
        }
    }

    /// Node resources this payload reserves.
    pub fn capacity(&self) -> Capacity {
        match self {
            WorkloadData::Vm(vm) => Capacity {
                cru: u64::from(vm.cpu),
                mru: vm.memory,
                sru: vm.rootfs_size,
                hru: 0,
            },
            WorkloadData::Disk(disk) => Capacity { sru: disk.size, ..Capacity::default() },
            WorkloadData::Zdb(zdb) => Capacity { hru: zdb.size, ..Capacity::default() },
            WorkloadData::Qsfs(qsfs) => Capacity {
                cru: QSFS_CRU,
                mru: QSFS_MRU,
                sru: qsfs.cache,
                hru: 0,
            },
            WorkloadData::GatewayName(_)
            | WorkloadData::GatewayFqdn(_)
            | WorkloadData::Network(_)
            | WorkloadData::PublicIp(_)
            | WorkloadData::LogShipper(_) => Capacity::default(),
        }
    }

    /// Farm public IPv4 addresses this payload reserves.
    pub fn public_ipv4_count(&self) -> u32 {
        match self {
            WorkloadData::PublicIp(ip) if ip.v4 => 1,
            _ => 0,
        }
    }

    /// Gateways terminate traffic on the node's own public IPv4.
    pub fn requires_public_ipv4(&self) -> bool {
        matches!(self, WorkloadData::GatewayName(_) | WorkloadData::GatewayFqdn(_))
    }

    /// Name gateways are served under the node's domain.
    pub fn requires_domain(&self) -> bool {
        matches!(self, WorkloadData::GatewayName(_))
    }

    /// Payload-local structural checks. Cross-workload references are checked
    /// by `Deployment::validate`.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            WorkloadData::Vm(vm) => {
                if vm.flist.is_empty() {
                    return Err("vm flist is empty".to_string());
                }
                if vm.cpu == 0 || vm.cpu > MAX_VM_CPU {
                    return Err(format!("vm cpu must be between 1 and {MAX_VM_CPU}, got {}", vm.cpu));
                }
                if vm.memory < MIN_VM_MEMORY {
                    return Err(format!(
                        "vm memory must be at least {}MiB, got {}MiB",
                        MIN_VM_MEMORY / MIB,
                        vm.memory / MIB
                    ));
                }
                if vm.network.is_empty() {
                    return Err("vm network is empty".to_string());
                }
                Ok(())
            }
            WorkloadData::Disk(disk) => {
                if disk.size == 0 {
                    return Err("disk size must be positive".to_string());
                }
                Ok(())
            }
            WorkloadData::Zdb(zdb) => {
                if zdb.size == 0 {
                    return Err("zdb size must be positive".to_string());
                }
                Ok(())
            }
            WorkloadData::Qsfs(qsfs) => {
                if qsfs.cache == 0 {
                    return Err("qsfs cache must be positive".to_string());
                }
                if qsfs.minimal_shards == 0 || qsfs.expected_shards < qsfs.minimal_shards {
                    return Err(format!(
                        "qsfs shards invalid: minimal={} expected={}",
                        qsfs.minimal_shards, qsfs.expected_shards
                    ));
                }
                if qsfs.metadata_endpoint.is_empty() {
                    return Err("qsfs metadata endpoint is empty".to_string());
                }
                Ok(())
            }
            WorkloadData::GatewayName(gw) => {
                if gw.name.is_empty()
                    || !gw.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                {
                    return Err(format!("invalid gateway name {:?}", gw.name));
                }
                if gw.backends.is_empty() {
                    return Err("gateway has no backends".to_string());
                }
                Ok(())
            }
            WorkloadData::GatewayFqdn(gw) => {
                if !gw.fqdn.contains('.') {
                    return Err(format!("invalid gateway fqdn {:?}", gw.fqdn));
                }
                if gw.backends.is_empty() {
                    return Err("gateway has no backends".to_string());
                }
                Ok(())
            }
            WorkloadData::Network(net) => {
                if net.ip_range.is_empty() || net.subnet.is_empty() {
                    return Err("network ip range and subnet are required".to_string());
                }
                if net.wireguard_private_key.is_empty() {
                    return Err("network wireguard key is empty".to_string());
                }
                Ok(())
            }
            WorkloadData::PublicIp(ip) => {
                if !ip.v4 && !ip.v6 {
                    return Err("public ip must request v4 or v6".to_string());
                }
                Ok(())
            }
            WorkloadData::LogShipper(logs) => {
                if logs.vm.is_empty() {
                    return Err("log shipper vm is empty".to_string());
                }
                if logs.destinations.is_empty() {
                    return Err("log shipper has no destinations".to_string());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workload {
    /// Unique within its deployment.
    pub name: String,

    #[serde(default)]
    pub version: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    #[serde(flatten)]
    pub data: WorkloadData,

    /// Filled in by the node.
    #[serde(default)]
    pub result: WorkloadResult,
}

impl Workload {
    pub fn new(name: impl Into<String>, data: WorkloadData) -> Self {
        Self {
            name: name.into(),
            version: 0,
            description: String::new(),
            metadata: String::new(),
            data,
            result: WorkloadResult::default(),
        }
    }

    pub fn workload_type(&self) -> WorkloadType {
        self.data.workload_type()
    }
}
