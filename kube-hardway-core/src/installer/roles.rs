use std::path::PathBuf;

use itertools::Itertools;

use crate::{
    execution::shell_quote,
    inventory::InventoryHost,
    kubernetes::kubeconfig,
    provisioner::API_SERVER_PORT,
    topology::NodeRole,
};

use super::{
    probe::{Probe, ProbeTarget},
    tasks::{BinaryArtifact, BinaryInstall, Task},
    units::{
        render_cni_loopback, render_containerd_unit, ApiServerUnitBuilder,
        ControllerManagerUnitBuilder, EtcdUnitBuilder, KubeProxyUnitBuilder, KubeletUnitBuilder,
        SchedulerUnitBuilder, TlsPaths, BINARY_DIRECTORY, CNI_BINARY_DIRECTORY,
        CNI_CONFIG_DIRECTORY, ETCD_CLIENT_PORT, ETCD_DATA_DIRECTORY, ETCD_DIRECTORY,
        KUBELET_DIRECTORY, KUBELET_PORT, KUBERNETES_DIRECTORY, KUBE_PROXY_DIRECTORY,
        SYSTEMD_DIRECTORY,
    },
    InstallContext, InstallationError, InstallerConfig,
};

const CERT_MODE: u32 = 0o644;
const SECRET_MODE: u32 = 0o600;

pub const ADMIN_KUBECONFIG_PATH: &str = "/var/lib/kubernetes/admin.kubeconfig";
pub const CONTAINERD_CONFIG_PATH: &str = "/etc/containerd/config.toml";

const CONTAINERD_CONFIG: &str = r#"version = 2

[plugins."io.containerd.grpc.v1.cri"]
  [plugins."io.containerd.grpc.v1.cri".containerd]
    snapshotter = "overlayfs"
    default_runtime_name = "runc"
  [plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc]
    runtime_type = "io.containerd.runc.v2"
  [plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc.options]
    SystemdCgroup = true
  [plugins."io.containerd.grpc.v1.cri".cni]
    bin_dir = "/opt/cni/bin"
    conf_dir = "/etc/cni/net.d"
"#;

/// Tasks of `host`, in the order they have to be applied.
pub fn host_tasks(
    role: NodeRole,
    host: &InventoryHost,
    context: &InstallContext<'_>,
    config: &InstallerConfig,
) -> Result<Vec<Task>, InstallationError> {
    match role {
        NodeRole::Etcd => etcd_tasks(host, context, config),
        NodeRole::Controller => controller_tasks(host, context, config),
        NodeRole::Worker => worker_tasks(host, context, config),
    }
}

/// Readiness checks gating the `started -> verified` transition of a role.
pub fn role_probes(role: NodeRole, context: &InstallContext<'_>) -> Vec<Probe> {
    match role {
        NodeRole::Etcd => {
            let tls = TlsPaths::in_directory(ETCD_DIRECTORY);

            vec![
                Probe::port(ETCD_CLIENT_PORT),
                Probe::cluster_health(
                    "etcd cluster health",
                    ProbeTarget::FirstHost,
                    format!(
                        "ETCDCTL_API=3 {BINARY_DIRECTORY}/etcdctl endpoint health --cluster \
                         --endpoints=https://127.0.0.1:{ETCD_CLIENT_PORT} \
                         --cacert={} --cert={} --key={}",
                        tls.ca, tls.cert, tls.key
                    ),
                ),
            ]
        }
        NodeRole::Controller => vec![
            Probe::port(API_SERVER_PORT),
            Probe::cluster_health(
                "api server health",
                ProbeTarget::EachHost,
                format!(
                    "{BINARY_DIRECTORY}/kubectl --kubeconfig {ADMIN_KUBECONFIG_PATH} get --raw=/healthz"
                ),
            ),
        ],
        NodeRole::Worker => {
            let workers = context
                .inventory
                .group(NodeRole::Worker)
                .iter()
                .map(|host| shell_quote(&host.hostname()))
                .join(" ");

            vec![
                Probe::port(KUBELET_PORT),
                Probe::cluster_health(
                    "worker registration",
                    ProbeTarget::FirstOf(NodeRole::Controller),
                    format!(
                        "{BINARY_DIRECTORY}/kubectl --kubeconfig {ADMIN_KUBECONFIG_PATH} get nodes {workers}"
                    ),
                ),
            ]
        }
    }
}

fn path(directory: &str, filename: &str) -> PathBuf {
    PathBuf::from(directory).join(filename)
}

fn unit_path(unit: &str) -> PathBuf {
    path(SYSTEMD_DIRECTORY, &format!("{unit}.service"))
}

/// CA, server certificate and key, uploaded into `directory` under the names [`TlsPaths`] expects.
fn tls_uploads(directory: &str, context: &InstallContext<'_>) -> Vec<Task> {
    let tls = TlsPaths::in_directory(directory);

    vec![
        Task::upload(&tls.ca, context.bundle.ca_cert_pem.clone(), CERT_MODE),
        Task::upload(&tls.cert, context.bundle.server_cert_pem.clone(), CERT_MODE),
        Task::upload(&tls.key, context.bundle.server_key_pem.clone(), SECRET_MODE),
    ]
}

fn render_error(host: &InventoryHost, what: &str, message: impl ToString) -> InstallationError {
    InstallationError::Render {
        node: host.id,
        what: what.to_owned(),
        message: message.to_string(),
    }
}

fn admin_kubeconfig(
    host: &InventoryHost,
    context: &InstallContext<'_>,
    server: &str,
) -> Result<String, InstallationError> {
    let admin = kubeconfig::admin(&context.topology.name, server, context.bundle);

    kubeconfig::render(&admin).map_err(|error| render_error(host, "kubeconfig", error))
}

/// Appends the unit file and its service, restarted whenever anything in `shared` or `tasks` changes.
fn with_service(shared: &[Task], mut tasks: Vec<Task>, unit: &str, rendered: String) -> Vec<Task> {
    let inputs = shared
        .iter()
        .chain(tasks.iter())
        .flat_map(Task::outputs)
        .chain(std::iter::once(unit_path(unit)))
        .collect::<Vec<_>>();

    tasks.push(Task::upload(unit_path(unit), rendered, CERT_MODE));
    tasks.push(Task::service(unit, inputs));
    tasks
}

fn kubernetes_binary(name: &str, config: &InstallerConfig) -> Task {
    Task::FetchBinary(BinaryArtifact::executable(
        name,
        config.downloads.kubernetes_url(&config.versions.kubernetes, name),
        BINARY_DIRECTORY,
    ))
}

fn etcd_tasks(
    host: &InventoryHost,
    context: &InstallContext<'_>,
    config: &InstallerConfig,
) -> Result<Vec<Task>, InstallationError> {
    let peers = context
        .inventory
        .group(NodeRole::Etcd)
        .iter()
        .map(|peer| (peer.hostname(), peer.address))
        .collect::<Vec<_>>();

    let unit = EtcdUnitBuilder::default()
        .name(host.hostname())
        .address(host.address)
        .peers(peers)
        .tls(TlsPaths::in_directory(ETCD_DIRECTORY))
        .cluster_token(format!("{}-etcd", context.topology.name))
        .build()
        .map_err(|error| render_error(host, "etcd unit", error))?;

    let mut tasks = tls_uploads(ETCD_DIRECTORY, context);
    tasks.push(Task::FetchBinary(BinaryArtifact {
        name: "etcd".to_owned(),
        url: config.downloads.etcd_url(&config.versions.etcd),
        install: BinaryInstall::Archive {
            directory: PathBuf::from(BINARY_DIRECTORY),
            strip_components: 1,
            provides: vec!["etcd".to_owned(), "etcdctl".to_owned()],
        },
    }));
    tasks.push(Task::Ensure {
        name: "etcd data directory".to_owned(),
        check: format!("test \"$(stat -c %a {ETCD_DATA_DIRECTORY} 2>/dev/null)\" = 700"),
        apply: format!("install -d -m 0700 {ETCD_DATA_DIRECTORY}"),
    });

    Ok(with_service(&[], tasks, "etcd", unit.render()))
}

fn controller_tasks(
    host: &InventoryHost,
    context: &InstallContext<'_>,
    config: &InstallerConfig,
) -> Result<Vec<Task>, InstallationError> {
    let topology = context.topology;
    let tls = TlsPaths::in_directory(KUBERNETES_DIRECTORY);
    let ca_key = format!("{KUBERNETES_DIRECTORY}/ca-key.pem");

    let api_server = ApiServerUnitBuilder::default()
        .address(host.address)
        .etcd_servers(context.inventory.group(NodeRole::Etcd).addresses())
        .apiserver_count(context.inventory.group(NodeRole::Controller).len() as u32)
        .service_cidr(topology.service_cidr)
        .tls(tls.clone())
        .build()
        .map_err(|error| render_error(host, "kube-apiserver unit", error))?;
    let controller_manager = ControllerManagerUnitBuilder::default()
        .cluster_name(topology.name.clone())
        .pod_cidr(topology.pod_cidr)
        .service_cidr(topology.service_cidr)
        .kubeconfig(ADMIN_KUBECONFIG_PATH.to_owned())
        .tls(tls)
        .ca_key(ca_key.clone())
        .build()
        .map_err(|error| render_error(host, "kube-controller-manager unit", error))?;
    let scheduler = SchedulerUnitBuilder::default()
        .kubeconfig(ADMIN_KUBECONFIG_PATH.to_owned())
        .build()
        .map_err(|error| render_error(host, "kube-scheduler unit", error))?;

    let mut material = tls_uploads(KUBERNETES_DIRECTORY, context);
    material.push(Task::upload(
        &ca_key,
        context.bundle.ca_key_pem.clone(),
        SECRET_MODE,
    ));
    material.push(Task::upload(
        ADMIN_KUBECONFIG_PATH,
        admin_kubeconfig(
            host,
            context,
            &format!("https://127.0.0.1:{API_SERVER_PORT}"),
        )?,
        SECRET_MODE,
    ));

    let mut tasks = material.clone();
    tasks.push(kubectl(config));

    let components = [
        ("kube-apiserver", api_server.render()),
        ("kube-controller-manager", controller_manager.render()),
        ("kube-scheduler", scheduler.render()),
    ];
    for (component, rendered) in components {
        tasks.extend(with_service(
            &material,
            vec![kubernetes_binary(component, config)],
            component,
            rendered,
        ));
    }

    Ok(tasks)
}

fn kubectl(config: &InstallerConfig) -> Task {
    kubernetes_binary("kubectl", config)
}

fn worker_tasks(
    host: &InventoryHost,
    context: &InstallContext<'_>,
    config: &InstallerConfig,
) -> Result<Vec<Task>, InstallationError> {
    let topology = context.topology;
    let versions = &config.versions;
    let downloads = &config.downloads;
    let cluster_dns = topology
        .dns_service_address()
        .ok_or_else(|| render_error(host, "kubelet unit", "service CIDR has no DNS address"))?;
    let kubelet_kubeconfig = format!("{KUBELET_DIRECTORY}/kubeconfig");
    let kube_proxy_kubeconfig = format!("{KUBE_PROXY_DIRECTORY}/kubeconfig");

    let kubelet = KubeletUnitBuilder::default()
        .hostname(host.hostname())
        .address(host.address)
        .kubeconfig(kubelet_kubeconfig.clone())
        .tls(TlsPaths::in_directory(KUBELET_DIRECTORY))
        .cluster_dns(cluster_dns)
        .cluster_domain(config.cluster_domain.clone())
        .build()
        .map_err(|error| render_error(host, "kubelet unit", error))?;
    let kube_proxy = KubeProxyUnitBuilder::default()
        .hostname(host.hostname())
        .pod_cidr(topology.pod_cidr)
        .kubeconfig(kube_proxy_kubeconfig.clone())
        .build()
        .map_err(|error| render_error(host, "kube-proxy unit", error))?;
    let cluster_kubeconfig = admin_kubeconfig(host, context, context.api_endpoint)?;

    let mut tasks = vec![
        Task::Ensure {
            name: "os packages".to_owned(),
            check: "command -v socat && command -v conntrack && command -v ipset".to_owned(),
            apply: "apt-get update && apt-get -y install socat conntrack ipset".to_owned(),
        },
        Task::Ensure {
            name: "swap disabled".to_owned(),
            check: "test -z \"$(swapon --show --noheadings)\"".to_owned(),
            apply: "swapoff -a".to_owned(),
        },
        Task::Ensure {
            name: "ip forwarding".to_owned(),
            check: "test \"$(sysctl -n net.ipv4.ip_forward)\" = 1".to_owned(),
            apply: "modprobe br_netfilter\nsysctl -w net.ipv4.ip_forward=1".to_owned(),
        },
    ];

    let runtime = vec![
        Task::FetchBinary(BinaryArtifact {
            name: "containerd".to_owned(),
            url: downloads.containerd_url(&versions.containerd),
            install: BinaryInstall::Archive {
                directory: PathBuf::from(BINARY_DIRECTORY),
                strip_components: 1,
                provides: vec![
                    "containerd".to_owned(),
                    "containerd-shim-runc-v2".to_owned(),
                    "ctr".to_owned(),
                ],
            },
        }),
        Task::FetchBinary(BinaryArtifact::executable(
            "runc",
            downloads.runc_url(&versions.runc),
            BINARY_DIRECTORY,
        )),
        Task::upload(CONTAINERD_CONFIG_PATH, CONTAINERD_CONFIG, CERT_MODE),
    ];
    tasks.extend(with_service(
        &[],
        runtime,
        "containerd",
        render_containerd_unit(),
    ));

    tasks.push(Task::FetchBinary(BinaryArtifact {
        name: "cni-plugins".to_owned(),
        url: downloads.cni_plugins_url(&versions.cni_plugins),
        install: BinaryInstall::Archive {
            directory: PathBuf::from(CNI_BINARY_DIRECTORY),
            strip_components: 1,
            provides: vec![
                "bridge".to_owned(),
                "host-local".to_owned(),
                "loopback".to_owned(),
            ],
        },
    }));
    tasks.push(Task::upload(
        path(CNI_CONFIG_DIRECTORY, "99-loopback.conf"),
        render_cni_loopback(),
        CERT_MODE,
    ));
    tasks.push(kubectl(config));

    let mut kubelet_tasks = tls_uploads(KUBELET_DIRECTORY, context);
    kubelet_tasks.push(Task::upload(
        &kubelet_kubeconfig,
        cluster_kubeconfig.clone(),
        SECRET_MODE,
    ));
    kubelet_tasks.push(kubernetes_binary("kubelet", config));
    tasks.extend(with_service(&[], kubelet_tasks, "kubelet", kubelet.render()));

    let kube_proxy_tasks = vec![
        Task::upload(&kube_proxy_kubeconfig, cluster_kubeconfig, SECRET_MODE),
        kubernetes_binary("kube-proxy", config),
    ];
    tasks.extend(with_service(
        &[],
        kube_proxy_tasks,
        "kube-proxy",
        kube_proxy.render(),
    ));

    Ok(tasks)
}
