//! Bootstrap script handed to the device being attached

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::Serialize;
use wgmesh_common::addressing::mgmt_link_local;
use wgmesh_common::config::schema::ATTR_ATTACH_CONFIG_KEY;
use wgmesh_common::config::{AttachRecord, FlatConfig, GlobalSettings};
use wgmesh_common::template::TemplateRenderer;
use wgmesh_common::{Error, KeyGenerator, NodeId, Result};

use crate::fsm::{DeviceReport, COMPLETION_MARKER};

/// Listen port of the management interface on the node
pub const NODE_MGMT_PORT: u16 = 51820;

const SCRIPT_TEMPLATE: &str = r#"# Output to controller
function doOutputToController #(output, verbose)
{
  http_response=$(curl --max-time 2 --silent "${curl_opts_bootstrap[@]}" --write-out %{http_code} --data-urlencode "scriptversion=$scriptversion" --data-urlencode "text=$1" --data-urlencode "verbose=$2" "https://$controller/bootstrap/response/" --output /dev/null && echo 0 || echo $?)
  retcode=$?
  if [ $retcode -eq 0 ]; then
    if [ $http_response -ne 2000 ] && [ $http_response -ne 00052 ]; then
      doOutputVerbose "Forwarding output to controller failed. Error response ${http_response}. Ignoring and continuing"
    fi
  else
    doOutputVerbose "Forwarding output to controller failed. curl returned error code ${retcode}. Ignoring and continuing"
  fi
}

# Prints a string in case verbose output is requested and tee to controller
function doOutputTeeVerbose #(output)
{
    doOutputVerbose "$1"
    doOutputToController "$1" 1
}

# Prints a string and tee to controller
function doOutputTee #(output, error)
{
    doOutput "$@"
    doOutputToController "$1" 0
}

sleep 1
doOutputTee "Executing node configuration script..."

doOutputTeeVerbose "Installing ssh keys..."
{{#each node_sshauthkeys}}
ssh_keys[{{@index}}]="{{this}}"
{{/each}}
ssh_authkeysfile='/root/.ssh/authorized_keys'
if [ ! -e "${ssh_authkeysfile}" ]; then
  install -D -m 700 /dev/null "${ssh_authkeysfile}"
fi
for key in "${ssh_keys[@]}"
do
  if ! grep -q "$key" "${ssh_authkeysfile}"; then
    echo "$key" >> "${ssh_authkeysfile}"
  fi
done

doOutputTeeVerbose "Writing configuration for WireGuard management interface"
tlwg_mgmt="
[Interface]
ListenPort = {{wg_listenport}}
PrivateKey = ${wg_private}
#PublicKey = ${wg_public}
Address = {{join wg_addresses ", "}}

[Peer]
Endpoint = {{wg_peer_endpoint}}
PublicKey = {{wg_peer_public}}
PresharedKey = {{wg_shared}}
AllowedIPs = {{join wg_peer_allowedips ", "}}
PersistentKeepalive = 25
"
echo "$tlwg_mgmt" > "$wg_configfile"

doOutputTee "{{completion_marker}}"
# config-key: {{config_key}}
# EOF
"#;

/// Values the bootstrap script is rendered from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapData {
    pub node_id: NodeId,
    pub config_key: Option<String>,
    pub node_sshauthkeys: Vec<String>,
    pub wg_listenport: u16,
    pub wg_addresses: Vec<String>,
    /// Fresh pre-shared key for the management link
    pub wg_shared: String,
    pub wg_peer_endpoint: String,
    pub wg_peer_public: String,
    pub wg_peer_allowedips: Vec<String>,
    pub completion_marker: &'static str,
}

impl BootstrapData {
    /// Collect the script parameters from a node's resolved view.
    ///
    /// `controller_address` is the management interface address of the
    /// controller (`fe80::1/64`); the node only routes that host to it.
    pub fn prepare(
        node_id: NodeId,
        view: &FlatConfig,
        controller_address: &str,
        keygen: &dyn KeyGenerator,
    ) -> Result<Self> {
        let global = GlobalSettings::from_view(view)?;
        let wg_peer_public = global.controller_wg_public.clone().ok_or_else(|| {
            Error::config("controller_wg_public is not set; is the management interface configured?")
        })?;
        let wg_shared = keygen
            .preshared_key()
            .ok_or_else(|| Error::config("generating a preshared key failed"))?;

        Ok(Self {
            node_id,
            config_key: view.get_str(ATTR_ATTACH_CONFIG_KEY).map(str::to_string),
            node_sshauthkeys: global.node_sshauthkeys.clone(),
            wg_listenport: NODE_MGMT_PORT,
            wg_addresses: vec![mgmt_link_local(node_id)?],
            wg_shared,
            wg_peer_endpoint: global.management_endpoint()?,
            wg_peer_public,
            wg_peer_allowedips: vec![host_route(controller_address)?],
            completion_marker: COMPLETION_MARKER,
        })
    }

    pub fn render(&self, renderer: &TemplateRenderer) -> Result<String> {
        renderer.render_str("bootstrap script", SCRIPT_TEMPLATE, self)
    }

    /// Values persisted in the node layer once the device is attached
    pub fn attach_record(&self, report: &DeviceReport) -> AttachRecord {
        let field = |key: &str| report.get(key).map(str::to_string);
        AttachRecord {
            scriptversion: field("scriptversion"),
            address: Some(report.address.to_string()),
            mac: field("mac"),
            hostname: field("hostname"),
            recovery_key: field("recovery-key"),
            config_key: field("config-key"),
            wg_public: field("wg_public"),
            wg_addresses: self.wg_addresses.clone(),
            wg_shared: Some(self.wg_shared.clone()),
        }
    }
}

/// `fe80::1/64` → `fe80::1/128`
fn host_route(address: &str) -> Result<String> {
    let network: IpNetwork = address
        .parse()
        .map_err(|e| Error::config(format!("invalid management address [{address}]: {e}")))?;
    let bits = match network.ip() {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    Ok(format!("{}/{bits}", network.ip()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use toml::Value;
    use wgmesh_common::NativeKeyGenerator;

    use super::*;

    fn view() -> FlatConfig {
        let mut view = FlatConfig::default();
        view.insert("controller_hostname", "ctl.example");
        view.insert("controller_wg_public", "CTLPUB=");
        view.insert(
            "node_sshauthkeys",
            Value::Array(vec![
                Value::String("ssh-ed25519 AAA one".into()),
                Value::String("ssh-ed25519 BBB two".into()),
            ]),
        );
        view.insert(ATTR_ATTACH_CONFIG_KEY, "ck-1");
        view
    }

    #[test]
    fn test_prepare() {
        let data = BootstrapData::prepare(11, &view(), "fe80::1/64", &NativeKeyGenerator).unwrap();
        assert_eq!(data.wg_addresses, vec!["fe80::b/64".to_string()]);
        assert_eq!(data.wg_peer_allowedips, vec!["fe80::1/128".to_string()]);
        assert_eq!(data.wg_peer_endpoint, "ctl.example:51820");
        assert_eq!(data.config_key.as_deref(), Some("ck-1"));
        assert!(!data.wg_shared.is_empty());
    }

    #[test]
    fn test_missing_controller_key() {
        let mut view = view();
        view.remove("controller_wg_public");
        assert!(matches!(
            BootstrapData::prepare(11, &view, "fe80::1/64", &NativeKeyGenerator),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_render_script() {
        let data = BootstrapData::prepare(11, &view(), "fe80::1/64", &NativeKeyGenerator).unwrap();
        let script = data.render(&TemplateRenderer::new()).unwrap();
        assert!(script.contains("ssh_keys[0]=\"ssh-ed25519 AAA one\""));
        assert!(script.contains("ssh_keys[1]=\"ssh-ed25519 BBB two\""));
        assert!(script.contains("Address = fe80::b/64\n"));
        assert!(script.contains("Endpoint = ctl.example:51820\n"));
        assert!(script.contains("AllowedIPs = fe80::1/128\n"));
        assert!(script.contains(&format!("doOutputTee \"{COMPLETION_MARKER}\"")));
        assert!(script.contains("# config-key: ck-1"));
    }

    #[test]
    fn test_attach_record() {
        let data = BootstrapData::prepare(11, &view(), "fe80::1/64", &NativeKeyGenerator).unwrap();
        let report = DeviceReport::new(
            "10.0.0.5".parse().unwrap(),
            BTreeMap::from([
                ("hostname".to_string(), "node-a".to_string()),
                ("wg_public".to_string(), "NODEPUB=".to_string()),
                ("recovery-key".to_string(), "rk".to_string()),
            ]),
        );
        let record = data.attach_record(&report);
        assert_eq!(record.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(record.wg_public.as_deref(), Some("NODEPUB="));
        assert_eq!(record.recovery_key.as_deref(), Some("rk"));
        assert_eq!(record.wg_shared.as_deref(), Some(data.wg_shared.as_str()));
        assert!(record.mac.is_none());
    }
}
