use std::net::Ipv4Addr;

use derive_builder::Builder;
use ipnet::Ipv4Net;
use itertools::Itertools;
use serde_json::json;

pub const BINARY_DIRECTORY: &str = "/usr/local/bin";
pub const SYSTEMD_DIRECTORY: &str = "/etc/systemd/system";
pub const ETCD_DIRECTORY: &str = "/etc/etcd";
pub const ETCD_DATA_DIRECTORY: &str = "/var/lib/etcd";
pub const KUBERNETES_DIRECTORY: &str = "/var/lib/kubernetes";
pub const KUBELET_DIRECTORY: &str = "/var/lib/kubelet";
pub const KUBE_PROXY_DIRECTORY: &str = "/var/lib/kube-proxy";
pub const CNI_BINARY_DIRECTORY: &str = "/opt/cni/bin";
pub const CNI_CONFIG_DIRECTORY: &str = "/etc/cni/net.d";
pub const CONTAINERD_SOCKET: &str = "unix:///var/run/containerd/containerd.sock";

pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;
pub const KUBELET_PORT: u16 = 10250;

/// TLS material paths as seen on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl TlsPaths {
    pub fn in_directory(directory: &str) -> Self {
        Self {
            ca: format!("{directory}/ca.pem"),
            cert: format!("{directory}/kubernetes.pem"),
            key: format!("{directory}/kubernetes-key.pem"),
        }
    }
}

fn render_unit(description: &str, documentation: &str, exec_start: &str, extra: &str) -> String {
    format!(
        "[Unit]
Description={description}
Documentation={documentation}
{extra}
[Service]
ExecStart={exec_start}
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
"
    )
}

fn render_command(binary: &str, flags: &[String]) -> String {
    std::iter::once(format!("{BINARY_DIRECTORY}/{binary}"))
        .chain(flags.iter().map(|flag| format!("  {flag}")))
        .join(" \\\n")
}

#[derive(Debug, Clone, Builder)]
pub struct EtcdUnit {
    /// member name, equal to the node hostname
    pub name: String,
    pub address: Ipv4Addr,
    /// every member of the etcd group, this one included
    pub peers: Vec<(String, Ipv4Addr)>,
    pub tls: TlsPaths,
    #[builder(default = "ETCD_DATA_DIRECTORY.to_owned()")]
    pub data_directory: String,
    #[builder(default = "\"etcd-cluster-0\".to_owned()")]
    pub cluster_token: String,
}

impl EtcdUnit {
    pub fn initial_cluster(&self) -> String {
        self.peers
            .iter()
            .map(|(name, address)| format!("{name}=https://{address}:{ETCD_PEER_PORT}"))
            .join(",")
    }

    pub fn render(&self) -> String {
        let address = self.address;
        let flags = vec![
            format!("--name {}", self.name),
            format!("--cert-file={}", self.tls.cert),
            format!("--key-file={}", self.tls.key),
            format!("--peer-cert-file={}", self.tls.cert),
            format!("--peer-key-file={}", self.tls.key),
            format!("--trusted-ca-file={}", self.tls.ca),
            format!("--peer-trusted-ca-file={}", self.tls.ca),
            "--peer-client-cert-auth".to_owned(),
            "--client-cert-auth".to_owned(),
            format!("--initial-advertise-peer-urls https://{address}:{ETCD_PEER_PORT}"),
            format!("--listen-peer-urls https://{address}:{ETCD_PEER_PORT}"),
            format!(
                "--listen-client-urls https://{address}:{ETCD_CLIENT_PORT},https://127.0.0.1:{ETCD_CLIENT_PORT}"
            ),
            format!("--advertise-client-urls https://{address}:{ETCD_CLIENT_PORT}"),
            format!("--initial-cluster-token {}", self.cluster_token),
            format!("--initial-cluster {}", self.initial_cluster()),
            "--initial-cluster-state new".to_owned(),
            format!("--data-dir={}", self.data_directory),
        ];

        render_unit(
            "etcd",
            "https://github.com/coreos",
            &render_command("etcd", &flags),
            "",
        )
    }
}

#[derive(Debug, Clone, Builder)]
pub struct ApiServerUnit {
    pub address: Ipv4Addr,
    pub etcd_servers: Vec<Ipv4Addr>,
    pub apiserver_count: u32,
    pub service_cidr: Ipv4Net,
    pub tls: TlsPaths,
    #[builder(default = "\"30000-32767\".to_owned()")]
    pub node_port_range: String,
}

impl ApiServerUnit {
    pub fn render(&self) -> String {
        let etcd_servers = self
            .etcd_servers
            .iter()
            .map(|address| format!("https://{address}:{ETCD_CLIENT_PORT}"))
            .join(",");
        let tls = &self.tls;
        let flags = vec![
            format!("--advertise-address={}", self.address),
            "--allow-privileged=true".to_owned(),
            format!("--apiserver-count={}", self.apiserver_count),
            "--authorization-mode=Node,RBAC".to_owned(),
            "--bind-address=0.0.0.0".to_owned(),
            format!("--client-ca-file={}", tls.ca),
            "--enable-admission-plugins=NamespaceLifecycle,NodeRestriction,LimitRanger,ServiceAccount,DefaultStorageClass,ResourceQuota".to_owned(),
            format!("--etcd-cafile={}", tls.ca),
            format!("--etcd-certfile={}", tls.cert),
            format!("--etcd-keyfile={}", tls.key),
            format!("--etcd-servers={etcd_servers}"),
            format!("--kubelet-certificate-authority={}", tls.ca),
            format!("--kubelet-client-certificate={}", tls.cert),
            format!("--kubelet-client-key={}", tls.key),
            "--runtime-config=api/all=true".to_owned(),
            format!("--service-account-key-file={}", tls.cert),
            format!("--service-account-signing-key-file={}", tls.key),
            format!(
                "--service-account-issuer=https://{}:{}",
                self.address,
                crate::provisioner::API_SERVER_PORT
            ),
            format!("--service-cluster-ip-range={}", self.service_cidr),
            format!("--service-node-port-range={}", self.node_port_range),
            format!("--tls-cert-file={}", tls.cert),
            format!("--tls-private-key-file={}", tls.key),
            "--v=2".to_owned(),
        ];

        render_unit(
            "Kubernetes API Server",
            "https://github.com/kubernetes/kubernetes",
            &render_command("kube-apiserver", &flags),
            "",
        )
    }
}

#[derive(Debug, Clone, Builder)]
pub struct ControllerManagerUnit {
    pub cluster_name: String,
    /// range node pod subnets are allocated from
    pub pod_cidr: Ipv4Net,
    pub service_cidr: Ipv4Net,
    pub kubeconfig: String,
    pub tls: TlsPaths,
    pub ca_key: String,
}

impl ControllerManagerUnit {
    pub fn render(&self) -> String {
        let flags = vec![
            "--bind-address=0.0.0.0".to_owned(),
            "--allocate-node-cidrs=true".to_owned(),
            format!("--cluster-cidr={}", self.pod_cidr),
            format!("--cluster-name={}", self.cluster_name),
            format!("--cluster-signing-cert-file={}", self.tls.ca),
            format!("--cluster-signing-key-file={}", self.ca_key),
            format!("--kubeconfig={}", self.kubeconfig),
            "--leader-elect=true".to_owned(),
            format!("--root-ca-file={}", self.tls.ca),
            format!("--service-account-private-key-file={}", self.tls.key),
            format!("--service-cluster-ip-range={}", self.service_cidr),
            "--use-service-account-credentials=true".to_owned(),
            "--v=2".to_owned(),
        ];

        render_unit(
            "Kubernetes Controller Manager",
            "https://github.com/kubernetes/kubernetes",
            &render_command("kube-controller-manager", &flags),
            "",
        )
    }
}

#[derive(Debug, Clone, Builder)]
pub struct SchedulerUnit {
    pub kubeconfig: String,
}

impl SchedulerUnit {
    pub fn render(&self) -> String {
        let flags = vec![
            format!("--kubeconfig={}", self.kubeconfig),
            "--leader-elect=true".to_owned(),
            "--v=2".to_owned(),
        ];

        render_unit(
            "Kubernetes Scheduler",
            "https://github.com/kubernetes/kubernetes",
            &render_command("kube-scheduler", &flags),
            "",
        )
    }
}

pub fn render_containerd_unit() -> String {
    let exec_start = format!("{BINARY_DIRECTORY}/containerd");

    format!(
        "[Unit]
Description=containerd container runtime
Documentation=https://containerd.io
After=network.target

[Service]
ExecStartPre=/sbin/modprobe overlay
ExecStart={exec_start}
Restart=always
RestartSec=5
Delegate=yes
KillMode=process
OOMScoreAdjust=-999
LimitNOFILE=1048576
LimitNPROC=infinity
LimitCORE=infinity

[Install]
WantedBy=multi-user.target
"
    )
}

#[derive(Debug, Clone, Builder)]
pub struct KubeletUnit {
    pub hostname: String,
    pub address: Ipv4Addr,
    pub kubeconfig: String,
    pub tls: TlsPaths,
    pub cluster_dns: Ipv4Addr,
    #[builder(default = "\"cluster.local\".to_owned()")]
    pub cluster_domain: String,
}

impl KubeletUnit {
    pub fn render(&self) -> String {
        let flags = vec![
            format!("--container-runtime-endpoint={CONTAINERD_SOCKET}"),
            format!("--kubeconfig={}", self.kubeconfig),
            "--register-node=true".to_owned(),
            format!("--hostname-override={}", self.hostname),
            format!("--node-ip={}", self.address),
            format!("--client-ca-file={}", self.tls.ca),
            format!("--tls-cert-file={}", self.tls.cert),
            format!("--tls-private-key-file={}", self.tls.key),
            format!("--cluster-dns={}", self.cluster_dns),
            format!("--cluster-domain={}", self.cluster_domain),
            "--cgroup-driver=systemd".to_owned(),
            "--v=2".to_owned(),
        ];

        render_unit(
            "Kubernetes Kubelet",
            "https://github.com/kubernetes/kubernetes",
            &render_command("kubelet", &flags),
            "After=containerd.service\nRequires=containerd.service\n",
        )
    }
}

#[derive(Debug, Clone, Builder)]
pub struct KubeProxyUnit {
    pub hostname: String,
    pub pod_cidr: Ipv4Net,
    pub kubeconfig: String,
}

impl KubeProxyUnit {
    pub fn render(&self) -> String {
        let flags = vec![
            format!("--cluster-cidr={}", self.pod_cidr),
            format!("--hostname-override={}", self.hostname),
            format!("--kubeconfig={}", self.kubeconfig),
            "--proxy-mode=iptables".to_owned(),
        ];

        render_unit(
            "Kubernetes Kube Proxy",
            "https://github.com/kubernetes/kubernetes",
            &render_command("kube-proxy", &flags),
            "",
        )
    }
}

/// Bridge network config of a node, once its pod subnet is known.
pub fn render_cni_bridge(pod_subnet: Ipv4Net) -> String {
    let config = json!({
        "cniVersion": "1.0.0",
        "name": "bridge",
        "type": "bridge",
        "bridge": "cnio0",
        "isGateway": true,
        "ipMasq": true,
        "ipam": {
            "type": "host-local",
            "ranges": [[{ "subnet": pod_subnet.to_string() }]],
            "routes": [{ "dst": "0.0.0.0/0" }]
        }
    });

    // a json! value always serializes
    serde_json::to_string_pretty(&config).unwrap_or_default()
}

pub fn render_cni_loopback() -> String {
    let config = json!({
        "cniVersion": "1.0.0",
        "name": "lo",
        "type": "loopback"
    });

    serde_json::to_string_pretty(&config).unwrap_or_default()
}
