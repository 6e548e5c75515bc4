//! eBPF object loader and XDP attachment

use super::interface::NetworkInterface;
use super::maps::MapManager;
use aya::programs::{Xdp, XdpFlags};
use aya::programs::xdp::XdpLinkId;
use aya::{Ebpf, EbpfLoader as ObjectLoader};
use aya_log::EbpfLogger;
use sipsieve_common::error::{Error, ErrorContext, IntoInternal, Result};
use sipsieve_ebpf::PROGRAM_NAME;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// XDP attachment mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XdpMode {
    /// Hardware offload (best performance, limited support)
    Offload,
    /// Driver mode (good performance, requires driver support)
    Driver,
    /// Generic/SKB mode (works everywhere, slower)
    Generic,
}

impl XdpMode {
    pub fn to_flags(self) -> XdpFlags {
        match self {
            XdpMode::Offload => XdpFlags::HW_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Generic => XdpFlags::SKB_MODE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XdpMode::Offload => "offload",
            XdpMode::Driver => "driver",
            XdpMode::Generic => "generic",
        }
    }

    /// Modes to try in order, starting with `self` and ending in generic.
    pub fn fallback_chain(self) -> &'static [XdpMode] {
        match self {
            XdpMode::Offload => &[XdpMode::Offload, XdpMode::Driver, XdpMode::Generic],
            XdpMode::Driver => &[XdpMode::Driver, XdpMode::Generic],
            XdpMode::Generic => &[XdpMode::Generic],
        }
    }
}

impl FromStr for XdpMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offload" | "hw" => Ok(XdpMode::Offload),
            "driver" | "drv" | "native" => Ok(XdpMode::Driver),
            "generic" | "skb" => Ok(XdpMode::Generic),
            other => Err(Error::invalid_input(format!("Unknown XDP mode '{}'", other))),
        }
    }
}

/// Attached XDP program info
#[derive(Debug)]
pub struct AttachedProgram {
    pub interface: String,
    pub mode: XdpMode,
    pub program_name: String,
    link_id: XdpLinkId,
}

/// Owns the loaded classifier object and its attachment
pub struct EbpfLoader {
    ebpf: Ebpf,
    attached: Option<AttachedProgram>,
}

impl EbpfLoader {
    /// Load the classifier object from a file, pinning shared maps under
    /// `pin_path` (or reusing maps already pinned there).
    pub fn load_from_file(path: &Path, pin_path: &Path) -> Result<Self> {
        info!("Loading eBPF object from {:?}", path);

        let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;

        Self::load_from_bytes(&data, pin_path)
    }

    /// Load the classifier object from bytes
    pub fn load_from_bytes(data: &[u8], pin_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(pin_path)
            .with_context(|| format!("Failed to create pin directory {:?}", pin_path))?;

        let ebpf = ObjectLoader::new()
            .map_pin_path(pin_path)
            .load(data)
            .map_err(|e| e.internal_with_context("Failed to load eBPF object"))?;

        info!(pin_path = ?pin_path, "eBPF object loaded");

        Ok(Self {
            ebpf,
            attached: None,
        })
    }

    /// Forward the program's log records to `tracing`. Optional: a program
    /// built without logging still works.
    pub fn init_logger(&mut self) {
        match EbpfLogger::init(&mut self.ebpf) {
            Ok(_) => info!("Forwarding XDP program logs"),
            Err(e) => warn!(error = %e, "Failed to initialize eBPF logger"),
        }
    }

    /// Move the classifier's maps out of the object
    pub fn take_maps(&mut self) -> Result<MapManager> {
        MapManager::from_ebpf(&mut self.ebpf)
    }

    /// Attach the classifier to an interface, falling back towards generic
    /// mode when the preferred mode is refused.
    pub fn attach_xdp(
        &mut self,
        interface: &NetworkInterface,
        preferred_mode: XdpMode,
    ) -> Result<XdpMode> {
        info!(
            "Attaching XDP program {} to interface {} (mode: {:?})",
            PROGRAM_NAME, interface.name, preferred_mode
        );

        if self.attached.is_some() {
            return Err(Error::internal("XDP program is already attached"));
        }

        let program: &mut Xdp = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("Program {} not found in object", PROGRAM_NAME))?
            .try_into()
            .map_err(|e| Error::Internal(format!("Not an XDP program: {}", e)))?;

        program
            .load()
            .map_err(|e| Error::Internal(format!("Failed to load XDP program: {}", e)))?;

        let mut last_error = None;
        let mut attached = None;
        for mode in preferred_mode.fallback_chain() {
            match program.attach(&interface.name, mode.to_flags()) {
                Ok(link_id) => {
                    attached = Some((*mode, link_id));
                    break;
                }
                Err(e) => {
                    warn!(mode = mode.as_str(), error = %e, "XDP attach mode refused");
                    last_error = Some(e);
                }
            }
        }

        let (mode, link_id) = match (attached, last_error) {
            (Some(attached), _) => attached,
            (None, Some(e)) => return Err(e.internal_with_context("Failed to attach XDP")),
            (None, None) => return Err(Error::internal("No XDP mode to try")),
        };

        info!(
            "Attached XDP program {} to {} with mode {:?}",
            PROGRAM_NAME, interface.name, mode
        );

        self.attached = Some(AttachedProgram {
            interface: interface.name.clone(),
            mode,
            program_name: PROGRAM_NAME.to_string(),
            link_id,
        });

        Ok(mode)
    }

    /// Detach the classifier. Pinned maps stay in place.
    pub fn detach_xdp(&mut self) -> Result<()> {
        let Some(attached) = self.attached.take() else {
            return Ok(());
        };

        info!(
            "Detaching XDP program {} from {}",
            attached.program_name, attached.interface
        );

        let program: &mut Xdp = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("Program {} not found in object", PROGRAM_NAME))?
            .try_into()
            .map_err(|e| Error::Internal(format!("Not an XDP program: {}", e)))?;

        program
            .detach(attached.link_id)
            .map_err(|e| e.internal_with_context("Failed to detach XDP"))
    }

    pub fn attached(&self) -> Option<&AttachedProgram> {
        self.attached.as_ref()
    }
}

impl Drop for EbpfLoader {
    fn drop(&mut self) {
        if let Err(e) = self.detach_xdp() {
            warn!(error = %e, "Failed to detach XDP program on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdp_mode_flags() {
        // XdpFlags doesn't implement PartialEq, so compare the underlying bits
        assert_eq!(
            XdpMode::Generic.to_flags().bits(),
            XdpFlags::SKB_MODE.bits()
        );
        assert_eq!(XdpMode::Driver.to_flags().bits(), XdpFlags::DRV_MODE.bits());
        assert_eq!(XdpMode::Offload.to_flags().bits(), XdpFlags::HW_MODE.bits());
    }

    #[test]
    fn test_xdp_mode_parse() {
        assert_eq!("driver".parse::<XdpMode>().unwrap(), XdpMode::Driver);
        assert_eq!(" SKB ".parse::<XdpMode>().unwrap(), XdpMode::Generic);
        assert_eq!("offload".parse::<XdpMode>().unwrap(), XdpMode::Offload);

        let err = "turbo".parse::<XdpMode>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_fallback_chain_ends_generic() {
        for mode in [XdpMode::Offload, XdpMode::Driver, XdpMode::Generic] {
            let chain = mode.fallback_chain();
            assert_eq!(chain[0], mode);
            assert_eq!(chain.last(), Some(&XdpMode::Generic));
        }
    }
}
