//! Site YAML loader
//!
//! Projects the free-form site description onto the typed [`Config`] model:
//!
//! ```yaml
//! config:
//!   OC_OCP_VERSION: "4.12"
//! edgeclusters:
//! - edgecluster0:
//!     config:
//!       tpm: false
//!     contrib: {}
//!     master0:
//!       bmc_url: redfish-virtualmedia+http://192.168.122.1:8000/redfish/v1/Systems/1
//!       bmc_user: admin
//!       bmc_pass: secret
//!       root_disk: /dev/vda
//!       storage_disk: [/dev/vdb, /dev/vdc]
//!       nic_ext_dhcp: enp1s0
//!       mac_ext_dhcp: "52:54:00:00:00:01"
//!       nic_int_static: enp2s0
//!       mac_int_static: "52:54:00:00:01:01"
//!       ignore_ifaces: enp3s0 enp4s0
//! ```
//!
//! The YAML tree never leaves this module; callers only see the model.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::models::{Cluster, Config, Nic, Node};
use crate::yaml::parse_yaml;
use crate::{Error, Result};

/// Where site YAML comes from
pub enum Source {
    /// A file on disk
    Path(PathBuf),
    /// YAML text
    Text(String),
    /// Raw YAML bytes
    Bytes(Vec<u8>),
    /// Any byte stream, read to the end
    Reader(Box<dyn Read + Send>),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Source::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Source::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Source::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<&str> for Source {
    /// Strings ending in `.yaml` or `.yml` are file names, anything else is
    /// YAML text
    fn from(value: &str) -> Self {
        if value.ends_with(".yaml") || value.ends_with(".yml") {
            Source::Path(PathBuf::from(value))
        } else {
            Source::Text(value.to_string())
        }
    }
}

impl From<&Path> for Source {
    fn from(value: &Path) -> Self {
        Source::Path(value.to_path_buf())
    }
}

impl From<PathBuf> for Source {
    fn from(value: PathBuf) -> Self {
        Source::Path(value)
    }
}

impl From<Vec<u8>> for Source {
    fn from(value: Vec<u8>) -> Self {
        Source::Bytes(value)
    }
}

/// Load a site description
pub fn load(source: impl Into<Source>) -> Result<Config> {
    let source = source.into();
    debug!(source = ?source, "Loading site configuration");

    let (name, text) = read_source(source)?;
    let tree = parse_yaml(&text).map_err(|e| match &name {
        Some(file) => Error::config_parse_file(file, e.to_string()),
        None => Error::config_parse(e.to_string()),
    })?;
    let config = load_tree(&tree)?;

    info!(
        clusters = config.clusters.len(),
        nodes = config.clusters.iter().map(|c| c.nodes.len()).sum::<usize>(),
        properties = config.properties.len(),
        "Loaded site configuration"
    );
    Ok(config)
}

fn read_source(source: Source) -> Result<(Option<String>, String)> {
    match source {
        Source::Path(path) => {
            let name = path.display().to_string();
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::config_parse_file(&name, e.to_string()))?;
            Ok((Some(name), text))
        }
        Source::Text(text) => Ok((None, text)),
        Source::Bytes(bytes) => String::from_utf8(bytes)
            .map(|text| (None, text))
            .map_err(|e| Error::config_parse(format!("input isn't valid UTF-8: {}", e))),
        Source::Reader(mut reader) => {
            let mut text = String::new();
            reader
                .read_to_string(&mut text)
                .map_err(|e| Error::config_parse(format!("failed to read input: {}", e)))?;
            Ok((None, text))
        }
    }
}

fn load_tree(tree: &Value) -> Result<Config> {
    let root = match tree {
        Value::Null => return Ok(Config::default()),
        Value::Object(map) => map,
        other => return Err(Error::config_schema("", expected("a mapping", other))),
    };

    let mut config = Config {
        properties: load_properties(root.get("config"))?,
        clusters: Vec::new(),
    };

    let items = match root.get("edgeclusters") {
        None | Some(Value::Null) => &[][..],
        Some(Value::Array(items)) => items.as_slice(),
        Some(other) => {
            return Err(Error::config_schema("edgeclusters", expected("a sequence", other)))
        }
    };

    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let path = format!("edgeclusters[{}]", i);
        let Value::Object(entries) = item else {
            return Err(Error::config_schema(path, expected("a mapping", item)));
        };
        for (name, body) in entries {
            if !seen.insert(name.clone()) {
                return Err(Error::config_schema(
                    &path,
                    format!("cluster '{}' is defined more than once", name),
                ));
            }
            config
                .clusters
                .push(load_cluster(&format!("{}.{}", path, name), name, body)?);
        }
    }
    config.clusters.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(config)
}

fn load_properties(value: Option<&Value>) -> Result<BTreeMap<String, String>> {
    let map = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map,
        Some(other) => return Err(Error::config_schema("config", expected("a mapping", other))),
    };
    map.iter()
        .map(|(key, value)| {
            scalar(&format!("config.{}", key), value).map(|v| (key.clone(), v))
        })
        .collect()
}

fn load_cluster(path: &str, name: &str, body: &Value) -> Result<Cluster> {
    let mut cluster = Cluster::new(name);
    let entries = match body {
        Value::Null => return Ok(cluster),
        Value::Object(map) => map,
        other => return Err(Error::config_schema(path, expected("a mapping", other))),
    };

    for (key, value) in entries {
        let field_path = format!("{}.{}", path, key);
        match key.as_str() {
            "contrib" => {}
            "config" => load_cluster_config(&field_path, value, &mut cluster)?,
            node_name => cluster.nodes.push(load_node(&field_path, node_name, value)?),
        }
    }
    cluster.nodes.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(
        cluster = %cluster.name,
        nodes = ?cluster.node_names(),
        "Loaded cluster"
    );
    Ok(cluster)
}

fn load_cluster_config(path: &str, value: &Value, cluster: &mut Cluster) -> Result<()> {
    let options = match value {
        Value::Null => return Ok(()),
        Value::Object(map) => map,
        other => return Err(Error::config_schema(path, expected("a mapping", other))),
    };
    match options.get("tpm") {
        None | Some(Value::Null) => {}
        Some(Value::Bool(tpm)) => cluster.tpm = *tpm,
        Some(other) => {
            return Err(Error::config_schema(
                format!("{}.tpm", path),
                expected("a boolean", other),
            ))
        }
    }
    Ok(())
}

fn load_node(path: &str, name: &str, value: &Value) -> Result<Node> {
    let mut node = Node::new(name);
    let empty = Map::new();
    let options = match value {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => return Err(Error::config_schema(path, expected("a mapping", other))),
    };
    let text = |key: &str| -> Result<Option<String>> {
        match options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => scalar(&format!("{}.{}", path, key), value).map(Some),
        }
    };

    if let Some(url) = text("bmc_url")? {
        node.bmc.url = url;
    }
    if let Some(user) = text("bmc_user")? {
        node.bmc.user = user;
    }
    if let Some(pass) = text("bmc_pass")? {
        node.bmc.pass = pass;
    }
    if let Some(disk) = text("root_disk")? {
        node.root_disk = disk;
    }

    node.storage_disks = match options.get("storage_disk") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(disks)) => disks
            .iter()
            .enumerate()
            .map(|(i, disk)| scalar(&format!("{}.storage_disk[{}]", path, i), disk))
            .collect::<Result<_>>()?,
        Some(other) => {
            return Err(Error::config_schema(
                format!("{}.storage_disk", path),
                expected("a sequence", other),
            ))
        }
    };

    node.internal_nic = nic(text("nic_int_static")?, text("mac_int_static")?);
    node.external_nic = nic(text("nic_ext_dhcp")?, text("mac_ext_dhcp")?);

    if let Some(ifaces) = text("ignore_ifaces")? {
        node.ignored_nics = ifaces
            .split(' ')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    Ok(node)
}

/// The MAC only counts when the interface is named
fn nic(name: Option<String>, mac: Option<String>) -> Option<Nic> {
    name.map(|name| Nic {
        name,
        mac: mac.unwrap_or_default(),
    })
}

fn scalar(path: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(Error::config_schema(path, expected("a scalar", other))),
    }
}

fn expected(what: &str, found: &Value) -> String {
    let kind = match found {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    };
    format!("expected {}, found {}", what, kind)
}
