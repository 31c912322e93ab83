use std::fmt::Write as _;
use std::path::Path;

use base64::Engine;
use facet::Facet;

use crate::error::FleetError;
use crate::model::ROLE_DEV;

const GO_VERSION: &str = "1.22.5";

/// Inputs for one role's first-boot configuration.
#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub role: &'a str,
    pub proxy: &'a str,
    pub no_proxy: &'a str,
    pub public_key: &'a Path,
    pub private_key: &'a Path,
}

/// Produces the per-role configuration document handed to the backend at launch.
pub trait ConfigRenderer {
    fn render(&self, input: &RenderInput<'_>, out: &Path) -> Result<(), FleetError>;
}

/// Writes `#cloud-config` YAML.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudInitRenderer;

impl ConfigRenderer for CloudInitRenderer {
    fn render(&self, input: &RenderInput<'_>, out: &Path) -> Result<(), FleetError> {
        let public = read_key(input.public_key)?;
        let private = read_key(input.private_key)?;
        let config = build_cloud_config(input, &public, &private);
        let doc = to_user_data(&config)?;

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FleetError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
        }
        std::fs::write(out, doc).map_err(|e| FleetError::Io {
            context: format!("writing {}", out.display()),
            source: e,
        })?;
        tracing::info!(role = input.role, path = %out.display(), "rendered cloud-config");
        Ok(())
    }
}

fn read_key(path: &Path) -> Result<String, FleetError> {
    std::fs::read_to_string(path).map_err(|e| FleetError::Configuration {
        message: format!("cannot read ssh key {}: {e}", path.display()),
    })
}

// ── document ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct CloudConfig {
    #[facet(default)]
    pub write_files: Vec<WriteFile>,
    #[facet(default)]
    pub runcmd: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct WriteFile {
    pub path: String,
    #[facet(default)]
    pub permissions: String,
    #[facet(default)]
    pub content: String,
}

pub fn build_cloud_config(input: &RenderInput<'_>, public_key: &str, private_key: &str) -> CloudConfig {
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut config = CloudConfig::default();

    if !input.proxy.is_empty() {
        let proxy = input.proxy;
        let no_proxy = input.no_proxy;
        config.write_files.push(WriteFile {
            path: "/usr/bin/proxy_on".into(),
            permissions: "0755".into(),
            content: format!(
                "#!/bin/bash\n\
                 export https_proxy=http://{proxy}\n\
                 export http_proxy=http://{proxy}\n\
                 export all_proxy=socks5://{proxy}\n\
                 export no_proxy={no_proxy}\n"
            ),
        });
        config.write_files.push(WriteFile {
            path: "/usr/bin/proxy_off".into(),
            permissions: "0755".into(),
            content: "#!/bin/bash\nunset https_proxy http_proxy all_proxy no_proxy\n".into(),
        });
    }

    if input.role == ROLE_DEV {
        config.write_files.push(WriteFile {
            path: "/usr/bin/golang-init".into(),
            permissions: "0755".into(),
            content: golang_init(),
        });
    }

    let public = b64.encode(public_key.trim_end());
    let private = b64.encode(private_key);
    config.runcmd = vec![
        "mkdir -p /root/.ssh".into(),
        format!("echo {public} | base64 -d >> /root/.ssh/authorized_keys"),
        format!("echo {private} | base64 -d > /root/.ssh/id_rsa"),
        "chmod 600 /root/.ssh/authorized_keys /root/.ssh/id_rsa".into(),
    ];
    if input.role == ROLE_DEV {
        config.runcmd.push("/usr/bin/golang-init".into());
    }
    config
}

fn golang_init() -> String {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        _ => "amd64",
    };
    format!(
        "#!/bin/bash\n\
         set -e\n\
         curl -fsSL https://go.dev/dl/go{GO_VERSION}.linux-{arch}.tar.gz | tar -C /usr/local -xz\n\
         echo 'export PATH=$PATH:/usr/local/go/bin:/root/go/bin' > /etc/profile.d/golang.sh\n"
    )
}

/// Serialize as cloud-init user data.
pub fn to_user_data(config: &CloudConfig) -> Result<String, FleetError> {
    let yaml = facet_yaml::to_string(config).map_err(|e| FleetError::Configuration {
        message: format!("cannot serialize cloud-config: {e}"),
    })?;
    // cloud-init wants #cloud-config on the first line, not a document separator
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Read back a rendered cloud-config file.
pub fn read_user_data(path: &Path) -> Result<CloudConfig, FleetError> {
    let text = std::fs::read_to_string(path).map_err(|e| FleetError::Io {
        context: format!("reading {}", path.display()),
        source: e,
    })?;
    facet_yaml::from_str(&text).map_err(|e| FleetError::Decode {
        context: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Flatten a cloud-config into a bash script for backends without cloud-init.
///
/// Commands touching cloud-init's own state are dropped.
pub fn to_script(config: &CloudConfig) -> String {
    let mut script = String::from("#!/bin/bash\nset -e\n\n");
    for file in &config.write_files {
        let dir = Path::new(&file.path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".into());
        let _ = writeln!(script, "mkdir -p {dir}");
        let _ = writeln!(script, "cat > {} <<'VMFLEET_EOF'", file.path);
        script.push_str(&file.content);
        if !file.content.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("VMFLEET_EOF\n");
        if !file.permissions.is_empty() {
            let _ = writeln!(script, "chmod {} {}", file.permissions, file.path);
        }
        script.push('\n');
    }
    script.push_str("apt-get update -y && apt-get install -y openssh-client openssh-server\n");
    script.push_str("mkdir -p ~/.ssh\n");
    for cmd in &config.runcmd {
        if cmd.contains("/etc/cloud") || cmd.contains("/var/lib/cloud") {
            continue;
        }
        script.push_str(cmd);
        script.push('\n');
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(role: &'a str, proxy: &'a str) -> RenderInput<'a> {
        RenderInput {
            role,
            proxy,
            no_proxy: "192.168.0.0/16",
            public_key: Path::new("/unused.pub"),
            private_key: Path::new("/unused"),
        }
    }

    #[test]
    fn user_data_is_valid_cloud_config() {
        let config = build_cloud_config(&input("node", ""), "ssh-ed25519 AAAA test", "PRIVATE");
        let ud = to_user_data(&config).unwrap();
        assert!(ud.starts_with("#cloud-config\n"));
        assert!(ud.contains("runcmd:"));
        assert!(ud.contains("authorized_keys"));
        assert!(!ud.contains("proxy_on"));
    }

    #[test]
    fn keys_are_base64_encoded() {
        let config = build_cloud_config(&input("node", ""), "ssh-ed25519 AAAA test\n", "PRIVATE");
        let b64 = base64::engine::general_purpose::STANDARD;
        let expected = b64.encode("ssh-ed25519 AAAA test");
        assert!(config.runcmd.iter().any(|c| c.contains(&expected)));
        assert!(!config.runcmd.iter().any(|c| c.contains("PRIVATE")));
    }

    #[test]
    fn proxy_scripts_when_configured() {
        let config = build_cloud_config(&input("node", "192.168.64.1:7890"), "k", "p");
        let paths: Vec<_> = config.write_files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["/usr/bin/proxy_on", "/usr/bin/proxy_off"]);
        assert!(config.write_files[0].content.contains("http_proxy=http://192.168.64.1:7890"));
        assert!(config.write_files[0].content.contains("no_proxy=192.168.0.0/16"));
        assert_eq!(config.write_files[0].permissions, "0755");
    }

    #[test]
    fn dev_role_gets_golang() {
        let config = build_cloud_config(&input("dev", ""), "k", "p");
        assert!(config.write_files.iter().any(|f| f.path == "/usr/bin/golang-init"));
        assert_eq!(config.runcmd.last().unwrap(), "/usr/bin/golang-init");
    }

    #[test]
    fn script_skips_cloud_state() {
        let config = CloudConfig {
            write_files: vec![WriteFile {
                path: "/usr/bin/hello".into(),
                permissions: "0755".into(),
                content: "echo hello".into(),
            }],
            runcmd: vec![
                "touch /etc/cloud/cloud-init.disabled".into(),
                "echo done".into(),
                "rm -rf /var/lib/cloud/instance".into(),
            ],
        };
        let script = to_script(&config);
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("cat > /usr/bin/hello <<'VMFLEET_EOF'\necho hello\nVMFLEET_EOF\n"));
        assert!(script.contains("chmod 0755 /usr/bin/hello"));
        assert!(script.contains("echo done\n"));
        assert!(!script.contains("/etc/cloud"));
        assert!(!script.contains("/var/lib/cloud"));
    }

    #[test]
    fn render_writes_file_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("id.pub");
        let private = dir.path().join("id");
        std::fs::write(&public, "ssh-ed25519 AAAA test\n").unwrap();
        std::fs::write(&private, "PRIVATE\n").unwrap();
        let out = dir.path().join("etc/demo/node.yaml");
        let input = RenderInput {
            role: "node",
            proxy: "10.0.0.1:3128",
            no_proxy: "",
            public_key: &public,
            private_key: &private,
        };
        CloudInitRenderer.render(&input, &out).unwrap();
        let back = read_user_data(&out).unwrap();
        assert_eq!(back.write_files.len(), 2);
        assert_eq!(back.runcmd.len(), 4);
    }

    #[test]
    fn missing_key_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let input = RenderInput {
            role: "node",
            proxy: "",
            no_proxy: "",
            public_key: &missing,
            private_key: &missing,
        };
        let err = CloudInitRenderer.render(&input, &dir.path().join("x.yaml")).unwrap_err();
        assert!(matches!(err, FleetError::Configuration { .. }));
    }
}
