//! Named debug ports of a scan chain.

use super::Dap;
use crate::architecture::arm::{dp::AdiVersion, DapError};
use crate::config::{AdiTargetConfig, ConfigError, DapConfig};
use crate::probe::{JtagEngine, ScanChain};

/// Owns the DAPs created on one scan chain, in creation order.
#[derive(Debug, Default)]
pub struct DapRegistry {
    chain: ScanChain,
    daps: Vec<Dap>,
}

impl DapRegistry {
    pub fn new(chain: ScanChain) -> Self {
        Self {
            chain,
            daps: Vec::new(),
        }
    }

    pub fn chain(&self) -> &ScanChain {
        &self.chain
    }

    /// Creates a DAP on the TAP named by the chain position of `config`.
    pub fn create(&mut self, config: &DapConfig) -> Result<&mut Dap, ConfigError> {
        if self.daps.iter().any(|dap| dap.dap_name() == config.name) {
            return Err(ConfigError::DuplicateName(config.name.clone()));
        }

        let tap = config
            .chain_position
            .as_deref()
            .ok_or_else(|| ConfigError::MissingChainPosition(config.name.clone()))?;
        let params = self
            .chain
            .position(tap)
            .and_then(|position| self.chain.chain_params(position))
            .ok_or_else(|| ConfigError::UnknownTap(tap.to_string()))?;
        let version = config.adi_version.map(AdiVersion::try_from).transpose()?;

        tracing::debug!("Creating DAP {} on {}", config.name, tap);

        self.daps.push(
            Dap::new(config.name.clone(), tap, params)
                .with_adi_version(version)
                .with_ignore_syspwrupack(config.ignore_syspwrupack),
        );
        let index = self.daps.len() - 1;
        Ok(&mut self.daps[index])
    }

    /// The names of all DAPs, in creation order.
    pub fn names(&self) -> Vec<&str> {
        self.daps.iter().map(Dap::dap_name).collect()
    }

    pub fn get(&self, name: &str) -> Result<&Dap, ConfigError> {
        self.daps
            .iter()
            .find(|dap| dap.dap_name() == name)
            .ok_or_else(|| ConfigError::UnknownDap(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Dap, ConfigError> {
        self.daps
            .iter_mut()
            .find(|dap| dap.dap_name() == name)
            .ok_or_else(|| ConfigError::UnknownDap(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dap> {
        self.daps.iter()
    }

    /// Initializes and connects every DAP whose TAP is enabled.
    ///
    /// Debug power is left alone, see [`Dap::power_up`]. Stops at the first
    /// DAP that fails to connect.
    pub fn init_all(&mut self, engine: &mut JtagEngine) -> Result<(), DapError> {
        tracing::debug!("Initializing all DAPs ...");

        for dap in &mut self.daps {
            let enabled = self.chain.tap(dap.tap()).is_some_and(|tap| tap.enabled);
            if !enabled {
                tracing::debug!("Skipping DAP {}, its TAP is disabled", dap.dap_name());
                continue;
            }
            dap.init(engine)?;
        }

        Ok(())
    }

    /// Resolves the DAP and AP a target uses and applies its AP base address.
    ///
    /// A target given only a chain position gets the DAP named `<tap>.dap`,
    /// which is created when it does not exist yet.
    pub fn configure_target(&mut self, config: &AdiTargetConfig) -> Result<AdiTarget, ConfigError> {
        config.validate()?;

        let dap = match (&config.dap, &config.chain_position) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingChainPosition(config.name.clone()))
            }
            (Some(dap), None) => self.get(dap)?.dap_name().to_string(),
            (None, Some(tap)) => {
                let name = format!("{tap}.dap");
                if self.get(&name).is_err() {
                    self.create(&DapConfig::builder(&name).chain_position(tap).build()?)?;
                }
                name
            }
            (None, None) => return Err(ConfigError::DapNotConfigured(config.name.clone())),
        };

        let ap_num = config.ap_num.map(|n| n as u8);
        if let Some(base) = config.ap_base {
            let ap_num =
                ap_num.ok_or_else(|| ConfigError::ApNumberNotConfigured(config.name.clone()))?;
            self.get_mut(&dap)?.access_port_mut(ap_num).set_base(base)?;
        }

        Ok(AdiTarget {
            name: config.name.clone(),
            dap,
            ap_num,
        })
    }
}

/// A target's place on a DAP.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AdiTarget {
    name: String,
    dap: String,
    ap_num: Option<u8>,
}

impl AdiTarget {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the DAP in the [`DapRegistry`].
    pub fn dap(&self) -> &str {
        &self.dap
    }

    pub fn ap_num(&self) -> Option<u8> {
        self.ap_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::arm::dap::mock::MockJtagDp;
    use crate::probe::TapConfig;
    use pretty_assertions::assert_eq;

    fn registry() -> DapRegistry {
        DapRegistry::new(ScanChain::new(vec![
            TapConfig::new("cpu.tap", 4),
            TapConfig {
                enabled: false,
                ..TapConfig::new("dsp.tap", 4)
            },
        ]))
    }

    fn dap_config(name: &str, tap: &str) -> DapConfig {
        DapConfig::builder(name).chain_position(tap).build().unwrap()
    }

    #[test]
    fn create_and_look_up() {
        let mut registry = registry();

        let dap = registry.create(&dap_config("cpu.dap", "cpu.tap")).unwrap();
        assert_eq!(dap.dap_name(), "cpu.dap");
        assert_eq!(dap.tap(), "cpu.tap");

        registry.create(&dap_config("dsp.dap", "dsp.tap")).unwrap();

        assert_eq!(registry.names(), vec!["cpu.dap", "dsp.dap"]);
        assert!(registry.get("cpu.dap").is_ok());
        assert!(matches!(
            registry.get("gpu.dap"),
            Err(ConfigError::UnknownDap(_))
        ));
    }

    #[test]
    fn names_must_be_unique() {
        let mut registry = registry();
        registry.create(&dap_config("cpu.dap", "cpu.tap")).unwrap();

        assert!(matches!(
            registry.create(&dap_config("cpu.dap", "dsp.tap")),
            Err(ConfigError::DuplicateName(name)) if name == "cpu.dap"
        ));
    }

    #[test]
    fn chain_position_must_exist() {
        let mut registry = registry();

        assert!(matches!(
            registry.create(&dap_config("gpu.dap", "gpu.tap")),
            Err(ConfigError::UnknownTap(_))
        ));

        let no_position = DapConfig {
            name: "x.dap".to_string(),
            chain_position: None,
            adi_version: None,
            ignore_syspwrupack: false,
        };
        assert!(matches!(
            registry.create(&no_position),
            Err(ConfigError::MissingChainPosition(_))
        ));
    }

    #[test]
    fn declared_version_is_carried() {
        let mut registry = registry();
        let config = DapConfig::builder("cpu.dap")
            .chain_position("cpu.tap")
            .adi_version(6)
            .unwrap()
            .build()
            .unwrap();

        let dap = registry.create(&config).unwrap();

        assert_eq!(dap.declared_version(), Some(AdiVersion::V6));
    }

    #[test]
    fn init_all_skips_disabled_taps() {
        let mut registry = registry();
        let chain = registry
            .create(&dap_config("cpu.dap", "cpu.tap"))
            .unwrap()
            .chain_params();
        registry.create(&dap_config("dsp.dap", "dsp.tap")).unwrap();
        let mock = MockJtagDp::adiv5().with_chain(chain);
        let mut engine = JtagEngine::new(Box::new(mock.probe()));

        registry.init_all(&mut engine).unwrap();

        assert_eq!(
            registry.get("cpu.dap").unwrap().version(),
            Some(AdiVersion::V5)
        );
        assert_eq!(registry.get("dsp.dap").unwrap().version(), None);
    }

    #[test]
    fn init_all_succeeds_without_power_acknowledges() {
        let mut registry = registry();
        let chain = registry
            .create(&dap_config("cpu.dap", "cpu.tap"))
            .unwrap()
            .chain_params();
        let mock = MockJtagDp::adiv5()
            .with_chain(chain)
            .without_power_up_acks();
        let mut engine = JtagEngine::new(Box::new(mock.probe()));

        registry.init_all(&mut engine).unwrap();

        assert_eq!(
            registry.get("cpu.dap").unwrap().version(),
            Some(AdiVersion::V5)
        );
        assert_eq!(mock.ctrl(), 0);
    }

    #[test]
    fn init_all_keeps_target_ap_base() {
        let mut registry = registry();
        let chain = registry
            .create(&dap_config("cpu.dap", "cpu.tap"))
            .unwrap()
            .chain_params();
        let config = AdiTargetConfig::builder("cpu.core0")
            .dap("cpu.dap")
            .unwrap()
            .ap_num(1)
            .unwrap()
            .ap_base(0x8000_0000)
            .unwrap()
            .build();
        registry.configure_target(&config).unwrap();
        let mock = MockJtagDp::adiv6().with_chain(chain);
        let mut engine = JtagEngine::new(Box::new(mock.probe()));

        registry.init_all(&mut engine).unwrap();

        let dap = registry.get("cpu.dap").unwrap();
        assert_eq!(dap.access_port(1).base(), 0x8000_0000);
        assert_eq!(dap.access_port(2).base(), 2 << 16);
    }

    #[test]
    fn target_on_named_dap_sets_ap_base() {
        let mut registry = registry();
        registry.create(&dap_config("cpu.dap", "cpu.tap")).unwrap();
        let config = AdiTargetConfig::builder("cpu.core0")
            .dap("cpu.dap")
            .unwrap()
            .ap_num(1)
            .unwrap()
            .ap_base(0x8000_0000)
            .unwrap()
            .build();

        let target = registry.configure_target(&config).unwrap();

        assert_eq!(target.dap(), "cpu.dap");
        assert_eq!(target.ap_num(), Some(1));
        assert_eq!(
            registry.get("cpu.dap").unwrap().access_port(1).base(),
            0x8000_0000
        );
    }

    #[test]
    fn target_by_chain_position_creates_a_dap() {
        let mut registry = registry();
        let config = AdiTargetConfig::builder("cpu.core0")
            .chain_position("cpu.tap")
            .unwrap()
            .build();

        let target = registry.configure_target(&config).unwrap();
        let again = registry.configure_target(&config).unwrap();

        assert_eq!(target.dap(), "cpu.tap.dap");
        assert_eq!(again.dap(), "cpu.tap.dap");
        assert_eq!(registry.names(), vec!["cpu.tap.dap"]);
    }

    #[test]
    fn target_needs_a_dap() {
        let mut registry = registry();

        assert!(matches!(
            registry.configure_target(&AdiTargetConfig::builder("t").build()),
            Err(ConfigError::DapNotConfigured(_))
        ));

        let unknown = AdiTargetConfig::builder("t").dap("gpu.dap").unwrap().build();
        assert!(matches!(
            registry.configure_target(&unknown),
            Err(ConfigError::UnknownDap(_))
        ));
    }
}
