use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use ndnfw_tables::fib::FibConfig;
use ndnfw_tables::ndt::NdtConfig;
use ndnfw_tables::pcct::{PcctConfig, SuppressConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ndt: NdtSection,
    pub fib: FibSection,
    pub pcct: PcctSection,
    pub fwd: FwdSection,
    pub face: FaceSection,
    pub pool: PoolSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ndt: NdtSection::default(),
            fib: FibSection::default(),
            pcct: PcctSection::default(),
            fwd: FwdSection::default(),
            face: FaceSection::default(),
            pool: PoolSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NdtSection {
    pub prefix_len: usize,
    pub index_bits: u32,
    pub sample_freq: u32,
}

impl Default for NdtSection {
    fn default() -> Self {
        Self {
            prefix_len: 2,
            index_bits: 16,
            sample_freq: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FibSection {
    pub capacity: usize,
    pub start_depth: usize,
    pub max_depth: usize,
}

impl Default for FibSection {
    fn default() -> Self {
        Self {
            capacity: 4096,
            start_depth: 1,
            max_depth: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PcctSection {
    pub capacity: usize,
    pub cs_direct_capacity: usize,
    pub cs_indirect_capacity: usize,
}

impl Default for PcctSection {
    fn default() -> Self {
        Self {
            capacity: 4096,
            cs_direct_capacity: 1024,
            cs_indirect_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FwdSection {
    pub n_inputs: usize,
    pub n_forwarders: usize,
    pub n_outputs: usize,
    pub interest_queue_size: usize,
    pub data_queue_size: usize,
    pub nack_queue_size: usize,
    /// Latency is sampled once per `2^latency_sample_freq` dequeues.
    pub latency_sample_freq: u32,
    pub suppress_multiplier: f64,
    pub suppress_min_ms: u64,
    pub suppress_max_ms: u64,
    /// RX/TX burst size per loop iteration.
    pub burst_size: usize,
    /// Dequeue budget for the Data queue; Nack inherits it and Interest
    /// gets half, preserving the Data > Nack > Interest priority without
    /// starvation.
    pub data_dequeue_burst: usize,
}

impl Default for FwdSection {
    fn default() -> Self {
        Self {
            n_inputs: 1,
            n_forwarders: 1,
            n_outputs: 1,
            interest_queue_size: 4096,
            data_queue_size: 4096,
            nack_queue_size: 1024,
            latency_sample_freq: 4,
            suppress_multiplier: 2.0,
            suppress_min_ms: 10,
            suppress_max_ms: 100,
            burst_size: 64,
            data_dequeue_burst: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceSection {
    pub reassembler_capacity: usize,
    /// Rounded up to a power of two.
    pub output_queue_size: usize,
    pub mtu: usize,
}

impl Default for FaceSection {
    fn default() -> Self {
        Self {
            reassembler_capacity: 64,
            output_queue_size: 4096,
            mtu: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub seg_size: usize,
    pub n_segs: usize,
    /// NUMA sockets to create pools on.
    pub sockets: Vec<u32>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            seg_size: 2176,
            n_segs: 8192,
            sockets: vec![0],
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate();
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Clamp and derive dependent values.
    pub fn validate(&mut self) {
        self.fwd.n_inputs = self.fwd.n_inputs.max(1);
        self.fwd.n_forwarders = self.fwd.n_forwarders.clamp(1, u8::MAX as usize);
        self.fwd.n_outputs = self.fwd.n_outputs.max(1);
        self.fwd.latency_sample_freq = self.fwd.latency_sample_freq.min(30);
        self.fwd.burst_size = self.fwd.burst_size.max(1);
        self.fwd.data_dequeue_burst = self.fwd.data_dequeue_burst.max(1);
        self.face.output_queue_size = self.face.output_queue_size.next_power_of_two();
        self.ndt.prefix_len = self.ndt.prefix_len.max(1);
        self.fib.start_depth = self.fib.start_depth.max(1);
    }

    pub fn interest_dequeue_burst(&self) -> usize {
        (self.fwd.data_dequeue_burst / 2).max(1)
    }

    pub fn nack_dequeue_burst(&self) -> usize {
        self.fwd.data_dequeue_burst
    }

    /// Output ring congestion threshold: three quarters of the ring.
    pub fn cong_threshold(&self) -> usize {
        self.face.output_queue_size * 3 / 4
    }

    pub fn ndt_config(&self) -> NdtConfig {
        NdtConfig {
            prefix_len: self.ndt.prefix_len,
            index_bits: self.ndt.index_bits,
            sample_freq: self.ndt.sample_freq,
        }
    }

    pub fn fib_config(&self) -> FibConfig {
        FibConfig {
            capacity: self.fib.capacity,
            start_depth: self.fib.start_depth,
            max_depth: self.fib.max_depth,
        }
    }

    pub fn pcct_config(&self) -> PcctConfig {
        PcctConfig {
            capacity: self.pcct.capacity,
            cs_direct_capacity: self.pcct.cs_direct_capacity,
            cs_indirect_capacity: self.pcct.cs_indirect_capacity,
        }
    }

    pub fn suppress_config(&self) -> SuppressConfig {
        SuppressConfig {
            min_ms: self.fwd.suppress_min_ms,
            max_ms: self.fwd.suppress_max_ms,
            multiplier: self.fwd.suppress_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = Config::default();
        assert_eq!(cfg.ndt.prefix_len, 2);
        assert_eq!(cfg.ndt.index_bits, 16);
        assert_eq!(cfg.ndt.sample_freq, 8);
        assert_eq!(cfg.fib.max_depth, 8);
        assert_eq!(cfg.fwd.latency_sample_freq, 4);
        assert_eq!(cfg.face.mtu, 1500);
    }

    #[test]
    fn test_validate_rounds_and_clamps() {
        let mut cfg = Config::default();
        cfg.face.output_queue_size = 5000;
        cfg.fwd.n_forwarders = 0;
        cfg.fwd.latency_sample_freq = 99;
        cfg.validate();
        assert_eq!(cfg.face.output_queue_size, 8192);
        assert_eq!(cfg.fwd.n_forwarders, 1);
        assert_eq!(cfg.fwd.latency_sample_freq, 30);
    }

    #[test]
    fn test_toml_roundtrip() {
        let parsed: Config = toml::from_str(
            r#"
            [ndt]
            prefix_len = 3
            [fwd]
            n_forwarders = 4
            data_dequeue_burst = 32
            "#,
        )
        .unwrap();
        assert_eq!(parsed.ndt.prefix_len, 3);
        assert_eq!(parsed.fwd.n_forwarders, 4);
        assert_eq!(parsed.interest_dequeue_burst(), 16);
        // untouched sections keep defaults
        assert_eq!(parsed.pcct.capacity, 4096);
    }
}
