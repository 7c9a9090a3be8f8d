// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Save, replace and restore of SR-IOV VF network configuration.
//!
//! Before a VF backing a guest network interface is handed over, the
//! host-side MAC/VLAN of the VF is saved under the manager's state
//! directory so it can be pushed back when the guest releases the device.
//! Interfaces carrying an 802.1Qbh port profile go through the switch
//! association primitives instead and need no local state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use slog::Logger;
use subprocess::{Exec, Redirection};

use crate::device;
use crate::error::{Error, Result};
use crate::types::{NetParent, PciHostdev, PortProfile};

/// Host-side network state of one VF, as persisted in the state directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfConfig {
    pub mac: String,
    #[serde(default)]
    pub vlan: Option<u16>,
}

/// The host primitives the hook drives. Split out as a trait so the
/// pipelines can be exercised without touching real host interfaces.
#[mockall::automock]
pub trait VfNetBackend: Send + Sync {
    /// Current MAC/VLAN of a VF, read from the PF.
    fn vf_config(&self, pf_netdev: &str, vf_index: u32) -> anyhow::Result<VfConfig>;

    /// Programs MAC/VLAN of a VF through the PF. A `None` VLAN clears any
    /// tag.
    fn set_vf_config(&self, pf_netdev: &str, vf_index: u32, config: &VfConfig)
        -> anyhow::Result<()>;

    /// 802.1Qbh association with the upstream switch.
    fn associate_profile(
        &self,
        pf_netdev: &str,
        vf_index: u32,
        profile_id: &str,
        mac: &str,
        dom_uuid: &str,
    ) -> anyhow::Result<()>;

    /// 802.1Qbh disassociation.
    fn disassociate_profile(
        &self,
        pf_netdev: &str,
        vf_index: u32,
        profile_id: &str,
        mac: &str,
    ) -> anyhow::Result<()>;
}

/// Rejects net-parent configurations this manager cannot program.
///
/// This runs during pipeline validation, before any device is touched, and
/// again inside [`replace_net_config`] so the hook stands on its own.
pub fn validate_net_config(net: &NetParent) -> Result<()> {
    match &net.virt_port {
        Some(PortProfile::Qbh { .. }) => {
            if net.vlan.is_some() {
                return Err(Error::UnsupportedConfig(
                    "direct VLAN configuration cannot be combined with a virtual port profile"
                        .to_string(),
                ));
            }
            Ok(())
        }
        Some(other) => Err(Error::UnsupportedConfig(format!(
            "virtual port profile type {} is not supported on SR-IOV VFs",
            other.type_name()
        ))),
        None => match &net.vlan {
            Some(vlan) if vlan.trunk => Err(Error::UnsupportedConfig(
                "VLAN trunking is not supported for SR-IOV VFs".to_string(),
            )),
            Some(vlan) if vlan.tags.len() != 1 => Err(Error::UnsupportedConfig(
                "exactly one VLAN tag must be given for an SR-IOV VF".to_string(),
            )),
            _ => Ok(()),
        },
    }
}

/// Saves the VF's current host-side config to the state directory, then
/// applies the guest-requested one (or associates the port profile).
///
/// A no-op for hostdevs that do not back a guest network interface.
pub fn replace_net_config(
    sysfs_root: &Path,
    state_dir: &Path,
    backend: &dyn VfNetBackend,
    logger: &Logger,
    hostdev: &PciHostdev,
    dom_uuid: &str,
) -> Result<()> {
    let net = match &hostdev.net {
        Some(net) => net,
        None => return Ok(()),
    };
    validate_net_config(net)?;

    if !device::is_virtual_function(sysfs_root, &hostdev.addr)? {
        return Err(Error::UnsupportedConfig(format!(
            "interface-backed hostdev {} is not an SR-IOV virtual function",
            hostdev.addr
        )));
    }
    let (pf_netdev, vf_index) = device::vf_info(sysfs_root, &hostdev.addr)?;

    match &net.virt_port {
        Some(PortProfile::Qbh { profile_id }) => {
            backend
                .associate_profile(&pf_netdev, vf_index, profile_id, &net.mac, dom_uuid)
                .map_err(|e| {
                    Error::OperationFailed(format!(
                        "802.1Qbh association of {} failed: {:#}",
                        hostdev.addr, e
                    ))
                })?;
            info!(logger, "associated port profile";
                  "device" => %hostdev.addr, "pf" => %pf_netdev, "vf" => vf_index);
        }
        Some(other) => {
            // validate_net_config already refused these.
            return Err(Error::UnsupportedConfig(format!(
                "virtual port profile type {} is not supported on SR-IOV VFs",
                other.type_name()
            )));
        }
        None => {
            let saved = backend.vf_config(&pf_netdev, vf_index).map_err(|e| {
                Error::OperationFailed(format!(
                    "cannot read configuration of {} vf {}: {:#}",
                    pf_netdev, vf_index, e
                ))
            })?;
            save_vf_config(state_dir, &pf_netdev, vf_index, &saved)?;

            let wanted = VfConfig {
                mac: net.mac.clone(),
                vlan: net.vlan.as_ref().and_then(|v| v.single_tag()),
            };
            backend
                .set_vf_config(&pf_netdev, vf_index, &wanted)
                .map_err(|e| {
                    Error::OperationFailed(format!(
                        "cannot configure {} vf {}: {:#}",
                        pf_netdev, vf_index, e
                    ))
                })?;
            info!(logger, "replaced VF network configuration";
                  "device" => %hostdev.addr, "pf" => %pf_netdev, "vf" => vf_index,
                  "mac" => %wanted.mac);
        }
    }
    Ok(())
}

/// Pushes the saved host-side config back to the VF (or disassociates the
/// port profile). Missing saved state is a soft condition: the device may
/// never have been reconfigured, or an older manager owned it.
pub fn restore_net_config(
    sysfs_root: &Path,
    state_dir: &Path,
    legacy_state_dir: Option<&Path>,
    backend: &dyn VfNetBackend,
    logger: &Logger,
    hostdev: &PciHostdev,
) -> Result<()> {
    let net = match &hostdev.net {
        Some(net) => net,
        None => return Ok(()),
    };
    if !device::is_virtual_function(sysfs_root, &hostdev.addr)? {
        return Ok(());
    }
    let (pf_netdev, vf_index) = device::vf_info(sysfs_root, &hostdev.addr)?;

    match &net.virt_port {
        Some(PortProfile::Qbh { profile_id }) => {
            backend
                .disassociate_profile(&pf_netdev, vf_index, profile_id, &net.mac)
                .map_err(|e| {
                    Error::OperationFailed(format!(
                        "802.1Qbh disassociation of {} failed: {:#}",
                        hostdev.addr, e
                    ))
                })?;
        }
        Some(_) => {
            // Never associated, nothing to undo.
        }
        None => match load_vf_config(state_dir, legacy_state_dir, &pf_netdev, vf_index)? {
            Some((saved, path)) => {
                backend
                    .set_vf_config(&pf_netdev, vf_index, &saved)
                    .map_err(|e| {
                        Error::OperationFailed(format!(
                            "cannot restore configuration of {} vf {}: {:#}",
                            pf_netdev, vf_index, e
                        ))
                    })?;
                if let Err(e) = fs::remove_file(&path) {
                    warn!(logger, "cannot remove saved VF configuration";
                          "path" => %path.display(), "error" => %e);
                }
                info!(logger, "restored VF network configuration";
                      "device" => %hostdev.addr, "pf" => %pf_netdev, "vf" => vf_index);
            }
            None => {
                debug!(logger, "no saved VF configuration to restore";
                       "device" => %hostdev.addr, "pf" => %pf_netdev, "vf" => vf_index);
            }
        },
    }
    Ok(())
}

fn config_file_name(pf_netdev: &str, vf_index: u32) -> String {
    format!("{}_vf{}", pf_netdev, vf_index)
}

fn save_vf_config(
    state_dir: &Path,
    pf_netdev: &str,
    vf_index: u32,
    config: &VfConfig,
) -> Result<()> {
    let path = state_dir.join(config_file_name(pf_netdev, vf_index));
    let blob = serde_json::to_string(config)
        .map_err(|e| Error::Internal(format!("cannot serialize VF config: {}", e)))?;
    fs::write(&path, blob).map_err(|e| {
        Error::OperationFailed(format!("cannot write {}: {}", path.display(), e))
    })
}

fn load_vf_config(
    state_dir: &Path,
    legacy_state_dir: Option<&Path>,
    pf_netdev: &str,
    vf_index: u32,
) -> Result<Option<(VfConfig, PathBuf)>> {
    let name = config_file_name(pf_netdev, vf_index);
    for dir in std::iter::once(state_dir).chain(legacy_state_dir) {
        let path = dir.join(&name);
        match fs::read_to_string(&path) {
            Ok(blob) => {
                let config = serde_json::from_str(&blob).map_err(|e| {
                    Error::OperationFailed(format!(
                        "malformed saved VF config {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                return Ok(Some((config, path)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(Error::OperationFailed(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(None)
}

/// Concrete backend driving the host's `ip` and `vdptool` binaries.
pub struct IpLinkVfBackend;

impl IpLinkVfBackend {
    fn run(argv: &[&str]) -> anyhow::Result<String> {
        let capture = Exec::cmd(argv[0])
            .args(&argv[1..])
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .with_context(|| format!("spawning {:?}", argv))?;
        if !capture.success() {
            bail!("{:?} failed: {}", argv, capture.stderr_str().trim());
        }
        Ok(capture.stdout_str())
    }
}

impl VfNetBackend for IpLinkVfBackend {
    fn vf_config(&self, pf_netdev: &str, vf_index: u32) -> anyhow::Result<VfConfig> {
        let out = Self::run(&["ip", "-json", "link", "show", "dev", pf_netdev])?;
        let links: serde_json::Value = serde_json::from_str(&out)
            .with_context(|| format!("parsing link state of {}", pf_netdev))?;
        let vfs = links
            .get(0)
            .and_then(|l| l.get("vfinfo_list"))
            .and_then(|v| v.as_array())
            .with_context(|| format!("{} reports no VFs", pf_netdev))?;
        for vf in vfs {
            if vf.get("vf").and_then(|v| v.as_u64()) != Some(u64::from(vf_index)) {
                continue;
            }
            let mac = vf
                .get("address")
                .and_then(|m| m.as_str())
                .with_context(|| format!("{} vf {} has no MAC", pf_netdev, vf_index))?
                .to_string();
            let vlan = vf
                .get("vlan_list")
                .and_then(|l| l.as_array())
                .and_then(|l| l.first())
                .and_then(|e| e.get("vlan"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u16)
                .filter(|v| *v != 0);
            return Ok(VfConfig { mac, vlan });
        }
        bail!("vf {} not reported for {}", vf_index, pf_netdev)
    }

    fn set_vf_config(
        &self,
        pf_netdev: &str,
        vf_index: u32,
        config: &VfConfig,
    ) -> anyhow::Result<()> {
        let vf = vf_index.to_string();
        Self::run(&[
            "ip", "link", "set", "dev", pf_netdev, "vf", &vf, "mac", &config.mac,
        ])?;
        let vlan = config.vlan.unwrap_or(0).to_string();
        Self::run(&[
            "ip", "link", "set", "dev", pf_netdev, "vf", &vf, "vlan", &vlan,
        ])?;
        Ok(())
    }

    fn associate_profile(
        &self,
        pf_netdev: &str,
        vf_index: u32,
        profile_id: &str,
        mac: &str,
        dom_uuid: &str,
    ) -> anyhow::Result<()> {
        let config = format!(
            "mode=assoc,profile={},mac={},uuid={},vf={}",
            profile_id, mac, dom_uuid, vf_index
        );
        Self::run(&["vdptool", "-i", pf_netdev, "-T", "-V", "assoc", "-c", &config])?;
        Ok(())
    }

    fn disassociate_profile(
        &self,
        pf_netdev: &str,
        vf_index: u32,
        profile_id: &str,
        mac: &str,
    ) -> anyhow::Result<()> {
        let config = format!(
            "mode=deassoc,profile={},mac={},vf={}",
            profile_id, mac, vf_index
        );
        Self::run(&["vdptool", "-i", pf_netdev, "-T", "-V", "deassoc", "-c", &config])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::device::tests::{addr, FakeSysfs};
    use crate::types::VlanConfig;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn vf_fixture() -> FakeSysfs {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");
        sysfs.add_device("0000:03:10.2");
        sysfs.make_vf("0000:03:10.2", "0000:03:00.0", 2, "enp3s0");
        sysfs
    }

    fn vf_hostdev(net: Option<NetParent>) -> PciHostdev {
        PciHostdev {
            addr: addr("0000:03:10.2"),
            managed: true,
            backend: Default::default(),
            net,
            origstate: None,
        }
    }

    #[test]
    fn test_replace_is_noop_without_net_parent() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();
        let backend = MockVfNetBackend::new();

        replace_net_config(
            sysfs.path(),
            state.path(),
            &backend,
            &test_logger(),
            &vf_hostdev(None),
            "uuid",
        )
        .unwrap();
    }

    #[test]
    fn test_replace_saves_then_applies() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();

        let mut backend = MockVfNetBackend::new();
        backend
            .expect_vf_config()
            .withf(|pf, vf| pf == "enp3s0" && *vf == 2)
            .times(1)
            .returning(|_, _| {
                Ok(VfConfig {
                    mac: "aa:bb:cc:dd:ee:01".to_string(),
                    vlan: Some(7),
                })
            });
        backend
            .expect_set_vf_config()
            .withf(|pf, vf, config| {
                pf == "enp3s0"
                    && *vf == 2
                    && *config
                        == VfConfig {
                            mac: "52:54:00:00:00:01".to_string(),
                            vlan: Some(42),
                        }
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: Some(VlanConfig {
                trunk: false,
                tags: vec![42],
            }),
            virt_port: None,
        }));
        replace_net_config(
            sysfs.path(),
            state.path(),
            &backend,
            &test_logger(),
            &hostdev,
            "uuid",
        )
        .unwrap();

        let blob = fs::read_to_string(state.path().join("enp3s0_vf2")).unwrap();
        let saved: VfConfig = serde_json::from_str(&blob).unwrap();
        assert_eq!(saved.mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(saved.vlan, Some(7));
    }

    #[test]
    fn test_replace_rejects_unsupported_profile() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();
        let backend = MockVfNetBackend::new();

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: None,
            virt_port: Some(PortProfile::Qbg {
                manager_id: 1,
                type_id: 2,
                type_id_version: 1,
                instance_id: "iid".to_string(),
            }),
        }));
        let err = replace_net_config(
            sysfs.path(),
            state.path(),
            &backend,
            &test_logger(),
            &hostdev,
            "uuid",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfig(_)));
        assert!(err.to_string().contains("802.1Qbg"));
    }

    #[test]
    fn test_replace_rejects_vlan_with_profile_and_trunking() {
        let with_profile = NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: Some(VlanConfig {
                trunk: false,
                tags: vec![42],
            }),
            virt_port: Some(PortProfile::Qbh {
                profile_id: "web".to_string(),
            }),
        };
        assert!(matches!(
            validate_net_config(&with_profile),
            Err(Error::UnsupportedConfig(_))
        ));

        let trunking = NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: Some(VlanConfig {
                trunk: true,
                tags: vec![42, 43],
            }),
            virt_port: None,
        };
        assert!(matches!(
            validate_net_config(&trunking),
            Err(Error::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn test_replace_rejects_non_vf() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();
        let backend = MockVfNetBackend::new();

        let hostdev = PciHostdev {
            addr: addr("0000:03:00.0"),
            managed: true,
            backend: Default::default(),
            net: Some(NetParent {
                mac: "52:54:00:00:00:01".to_string(),
                vlan: None,
                virt_port: None,
            }),
            origstate: None,
        };
        let err = replace_net_config(
            sysfs.path(),
            state.path(),
            &backend,
            &test_logger(),
            &hostdev,
            "uuid",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfig(_)));
    }

    #[test]
    fn test_replace_associates_qbh_profile() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();

        let mut backend = MockVfNetBackend::new();
        backend
            .expect_associate_profile()
            .withf(|pf, vf, profile, mac, uuid| {
                pf == "enp3s0"
                    && *vf == 2
                    && profile == "web-tier"
                    && mac == "52:54:00:00:00:01"
                    && uuid == "a-uuid"
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: None,
            virt_port: Some(PortProfile::Qbh {
                profile_id: "web-tier".to_string(),
            }),
        }));
        replace_net_config(
            sysfs.path(),
            state.path(),
            &backend,
            &test_logger(),
            &hostdev,
            "a-uuid",
        )
        .unwrap();

        // No state file for port-profile interfaces.
        assert_eq!(fs::read_dir(state.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_restore_pushes_saved_config_and_removes_file() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();
        let saved = VfConfig {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            vlan: None,
        };
        fs::write(
            state.path().join("enp3s0_vf2"),
            serde_json::to_string(&saved).unwrap(),
        )
        .unwrap();

        let mut backend = MockVfNetBackend::new();
        let expected = saved.clone();
        backend
            .expect_set_vf_config()
            .withf(move |pf, vf, config| pf == "enp3s0" && *vf == 2 && *config == expected)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: None,
            virt_port: None,
        }));
        restore_net_config(
            sysfs.path(),
            state.path(),
            None,
            &backend,
            &test_logger(),
            &hostdev,
        )
        .unwrap();
        assert!(!state.path().join("enp3s0_vf2").exists());
    }

    #[test]
    fn test_restore_falls_back_to_legacy_dir() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();
        let legacy = TempDir::new().unwrap();
        let saved = VfConfig {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            vlan: Some(7),
        };
        fs::write(
            legacy.path().join("enp3s0_vf2"),
            serde_json::to_string(&saved).unwrap(),
        )
        .unwrap();

        let mut backend = MockVfNetBackend::new();
        backend
            .expect_set_vf_config()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: None,
            virt_port: None,
        }));
        restore_net_config(
            sysfs.path(),
            state.path(),
            Some(legacy.path()),
            &backend,
            &test_logger(),
            &hostdev,
        )
        .unwrap();
        assert!(!legacy.path().join("enp3s0_vf2").exists());
    }

    #[test]
    fn test_restore_without_saved_state_is_soft() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();
        let backend = MockVfNetBackend::new();

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: None,
            virt_port: None,
        }));
        restore_net_config(
            sysfs.path(),
            state.path(),
            None,
            &backend,
            &test_logger(),
            &hostdev,
        )
        .unwrap();
    }

    #[test]
    fn test_restore_disassociates_qbh_profile() {
        let sysfs = vf_fixture();
        let state = TempDir::new().unwrap();

        let mut backend = MockVfNetBackend::new();
        backend
            .expect_disassociate_profile()
            .withf(|pf, vf, profile, mac| {
                pf == "enp3s0" && *vf == 2 && profile == "web-tier" && mac == "52:54:00:00:00:01"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let hostdev = vf_hostdev(Some(NetParent {
            mac: "52:54:00:00:00:01".to_string(),
            vlan: None,
            virt_port: Some(PortProfile::Qbh {
                profile_id: "web-tier".to_string(),
            }),
        }));
        restore_net_config(
            sysfs.path(),
            state.path(),
            None,
            &backend,
            &test_logger(),
            &hostdev,
        )
        .unwrap();
    }
}
