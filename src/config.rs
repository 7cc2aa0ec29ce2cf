use amd64_core::Register;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path};

/// Layout and loop bound of a `fib-bench` run. Numbers are hex strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Base of the read/execute code region.
    #[serde(default = "BenchConfig::default_code_address", with = "hex_string")]
    pub code_address: u64,

    /// Loop bound patched into the `cmp rcx` immediate.
    #[serde(default = "BenchConfig::default_iterations", with = "hex_string")]
    pub iterations: u64,

    /// Count through hooks instead of the session counters.
    #[serde(default = "BenchConfig::default_hooks")]
    pub hooks: bool,

    #[serde(default)]
    pub stack: StackConfig,

    /// Extra register values set before RSP.
    #[serde(default, with = "register_map")]
    pub registers: HashMap<Register, u64>,
}

/// The read/write region the loop pushes its three values onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "StackConfig::default_stack_base", with = "hex_string")]
    pub base_address: u64,

    #[serde(default = "StackConfig::default_stack_size", with = "hex_string")]
    pub size: u64,

    /// RSP at start, relative to `base_address`.
    #[serde(default = "StackConfig::default_initial_offset", with = "hex_string")]
    pub initial_offset: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            base_address: Self::default_stack_base(),
            size: Self::default_stack_size(),
            initial_offset: Self::default_initial_offset(),
        }
    }
}

impl StackConfig {
    fn default_stack_base() -> u64 {
        0x1234_5000
    }

    fn default_stack_size() -> u64 {
        0x1000
    }

    fn default_initial_offset() -> u64 {
        0x800
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            code_address: Self::default_code_address(),
            iterations: Self::default_iterations(),
            hooks: Self::default_hooks(),
            stack: StackConfig::default(),
            registers: HashMap::new(),
        }
    }
}

impl BenchConfig {
    fn default_code_address() -> u64 {
        0x4141_0000
    }

    fn default_iterations() -> u64 {
        0x00FF_FFFF
    }

    fn default_hooks() -> bool {
        true
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path.as_ref(), e))?;
        Self::from_toml(&contents)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path.as_ref(), e))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: BenchConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(&path, contents)
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path.as_ref(), e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 || self.iterations > i32::MAX as u64 {
            return Err(anyhow!(
                "iterations must be between 1 and {:#x}, got {:#x}",
                i32::MAX,
                self.iterations
            ));
        }
        if self.stack.initial_offset < 0x18 || self.stack.initial_offset > self.stack.size {
            return Err(anyhow!(
                "stack offset {:#x} does not fit a stack of {:#x} bytes",
                self.stack.initial_offset,
                self.stack.size
            ));
        }
        Ok(())
    }

    pub fn create_sample() -> Self {
        let mut registers = HashMap::new();
        registers.insert(Register::RDX, 0);

        BenchConfig {
            iterations: 0x10_0000,
            registers,
            ..BenchConfig::default()
        }
    }
}

/// Hex with an optional `0x` prefix and `_` separators.
fn parse_hex(s: &str) -> Result<u64> {
    let cleaned = s.replace('_', "");
    let digits = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    u64::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex string '{}': {}", s, e))
}

mod hex_string {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str: String = String::deserialize(deserializer)?;
        parse_hex(&hex_str).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("0x{:x}", value).serialize(serializer)
    }
}

mod register_map {
    use super::parse_hex;
    use amd64_core::Register;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::{BTreeMap, HashMap};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<Register, u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_map: HashMap<String, String> = HashMap::deserialize(deserializer)?;
        let mut register_map = HashMap::new();

        for (reg_name, value_str) in string_map {
            let register: Register = reg_name.parse().map_err(serde::de::Error::custom)?;
            let value = parse_hex(&value_str).map_err(serde::de::Error::custom)?;
            register_map.insert(register, value);
        }

        Ok(register_map)
    }

    pub fn serialize<S>(map: &HashMap<Register, u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let string_map: BTreeMap<String, String> = map
            .iter()
            .map(|(reg, value)| (reg.to_string(), format!("0x{:x}", value)))
            .collect();
        string_map.serialize(serializer)
    }
}
