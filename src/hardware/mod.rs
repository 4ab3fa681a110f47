//! Hardware that is not reached through an SCPI adapter.
//!
//! - [`linkbone`]: telnet client for the relay matrix switch
//! - [`mock`]: simulated implementations of every instrument trait

pub mod linkbone;
pub mod mock;

pub use linkbone::{LinkBoneOptions, LinkBoneSwitch};
pub use mock::{
    MockCryostat, MockCurrentSource, MockPulser, MockSwitch, MockVoltmeter, SampleModel, SimBench,
};
