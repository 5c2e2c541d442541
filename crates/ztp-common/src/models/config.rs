use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::Cluster;
use crate::yaml::to_yaml;
use crate::{Error, Result};

/// A whole site: global properties plus the edge clusters to provision
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Global `config:` entries, used as template input and as option
    /// fallbacks
    pub properties: BTreeMap<String, String>,
    /// Clusters, sorted by name
    pub clusters: Vec<Cluster>,
}

impl Config {
    /// Find a cluster by name
    pub fn lookup_cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Find a cluster by name for modification
    pub fn lookup_cluster_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        self.clusters.iter_mut().find(|c| c.name == name)
    }

    /// Names of all clusters
    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.iter().map(|c| c.name.as_str()).collect()
    }

    /// Serialize the fields the loader recognises back to site YAML
    ///
    /// Values produced by enrichment (keys, VIPs, discovered addresses) are
    /// not part of the site format and are left out.
    pub fn save(&self) -> Result<String> {
        to_yaml(&self.to_site_tree()).map_err(|e| Error::serialization(e.to_string()))
    }

    fn to_site_tree(&self) -> Value {
        let clusters: Vec<Value> = self
            .clusters
            .iter()
            .map(|cluster| {
                let mut body = Map::new();
                if cluster.tpm {
                    body.insert("config".to_string(), json!({ "tpm": true }));
                }
                for node in &cluster.nodes {
                    let mut entry = Map::new();
                    let mut put = |key: &str, value: &str| {
                        if !value.is_empty() {
                            entry.insert(key.to_string(), Value::String(value.to_string()));
                        }
                    };
                    put("bmc_url", &node.bmc.url);
                    put("bmc_user", &node.bmc.user);
                    put("bmc_pass", &node.bmc.pass);
                    put("root_disk", &node.root_disk);
                    if let Some(nic) = &node.external_nic {
                        put("nic_ext_dhcp", &nic.name);
                        put("mac_ext_dhcp", &nic.mac);
                    }
                    if let Some(nic) = &node.internal_nic {
                        put("nic_int_static", &nic.name);
                        put("mac_int_static", &nic.mac);
                    }
                    put("ignore_ifaces", &node.ignored_nics.join(" "));
                    if !node.storage_disks.is_empty() {
                        entry.insert("storage_disk".to_string(), json!(node.storage_disks));
                    }
                    body.insert(node.name.clone(), Value::Object(entry));
                }
                let mut item = Map::new();
                item.insert(cluster.name.clone(), Value::Object(body));
                Value::Object(item)
            })
            .collect();

        let mut root = Map::new();
        if !self.properties.is_empty() {
            root.insert("config".to_string(), json!(self.properties));
        }
        root.insert("edgeclusters".to_string(), Value::Array(clusters));
        Value::Object(root)
    }
}
