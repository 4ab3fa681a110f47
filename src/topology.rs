//! Physical wiring of the rig: rotator puck pins, instrument terminals and the
//! relay matrix switch ports they are patched into.
//!
//! The [`Topology`] is built once per session and is read-only afterwards. Its
//! main job is translating human-readable connection names ("HB+", "V1-") into
//! switch port letters, which happens once when a measurement plan is built.

use crate::error::{AppResult, DaqError, LookupError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Rotator puck pins that are wired to the breakout box.
pub const PUCK_PIN_RANGE: RangeInclusive<u8> = 7..=14;

/// Breakout box numbering is offset from the puck pin numbering.
const BREAKOUT_BOX_OFFSET: u8 = 4;

/// A port on the 2x8 relay matrix. The top row (`a`-`h`) is wired to the
/// breakout box, the bottom row (`i`-`p`) to instrument terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct SwitchPort(char);

impl SwitchPort {
    /// Top row labels, in order.
    pub const TOP_ROW: [char; 8] = ['a', 'b', 'c', 'd', 'e', 'f', 'g', 'h'];

    /// Parse a port label.
    pub fn new(label: char) -> AppResult<Self> {
        if ('a'..='p').contains(&label) {
            Ok(Self(label))
        } else {
            Err(DaqError::Configuration(format!(
                "'{}' is not a switch port; ports are labelled a-p",
                label
            )))
        }
    }

    /// Whether this port is on the breakout box row.
    pub fn is_top_row(&self) -> bool {
        Self::TOP_ROW.contains(&self.0)
    }

    /// The port letter.
    pub fn label(&self) -> char {
        self.0
    }
}

impl TryFrom<char> for SwitchPort {
    type Error = DaqError;

    fn try_from(value: char) -> AppResult<Self> {
        Self::new(value)
    }
}

impl From<SwitchPort> for char {
    fn from(port: SwitchPort) -> char {
        port.0
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named rotator puck pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PuckConnection {
    pin: u8,
    name: String,
    port: Option<SwitchPort>,
}

impl PuckConnection {
    /// Validates the pin number and, when given, that the port is on the top row.
    pub fn new(pin: u8, name: impl Into<String>, port: Option<SwitchPort>) -> AppResult<Self> {
        if !PUCK_PIN_RANGE.contains(&pin) {
            return Err(DaqError::Configuration(format!(
                "Pin number must be between {} and {}, got {} (use the pin number of the puck)",
                PUCK_PIN_RANGE.start(),
                PUCK_PIN_RANGE.end(),
                pin
            )));
        }
        if let Some(port) = port {
            if !port.is_top_row() {
                return Err(DaqError::Configuration(format!(
                    "Switch box connection '{}' must be in the top row (a-h)",
                    port
                )));
            }
        }
        Ok(Self {
            pin,
            name: name.into(),
            port,
        })
    }

    /// Puck pin number.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Switch port, if the pin is patched into the matrix.
    pub fn port(&self) -> Option<SwitchPort> {
        self.port
    }

    /// Breakout box socket number.
    pub fn breakout_box_number(&self) -> u8 {
        self.pin - BREAKOUT_BOX_OFFSET
    }
}

/// Supported instrument models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentModel {
    /// Keithley 2182 nanovoltmeter.
    #[serde(rename = "keithley2182", alias = "2182")]
    Keithley2182,
    /// Keithley 2400 source meter, used as a DC current source.
    #[serde(rename = "keithley2400", alias = "2400")]
    Keithley2400,
    /// Keithley 6221 AC/DC current source, used as a pulser.
    #[serde(rename = "keithley6221", alias = "6221")]
    Keithley6221,
}

impl InstrumentModel {
    /// The role this model plays in a measurement.
    pub fn kind(&self) -> InstrumentKind {
        match self {
            InstrumentModel::Keithley2182 => InstrumentKind::Voltmeter,
            InstrumentModel::Keithley2400 => InstrumentKind::CurrentSource,
            InstrumentModel::Keithley6221 => InstrumentKind::Pulser,
        }
    }

    /// Name given to the instrument when the configuration does not provide one.
    pub fn default_name(&self) -> &'static str {
        match self.kind() {
            InstrumentKind::Voltmeter => "Voltmeter",
            InstrumentKind::CurrentSource => "CurrentSource",
            InstrumentKind::Pulser => "Pulser",
        }
    }

    fn allowed_terminal_counts(&self) -> &'static [usize] {
        match self {
            InstrumentModel::Keithley2182 => &[0, 2, 4],
            InstrumentModel::Keithley2400 | InstrumentModel::Keithley6221 => &[0, 2],
        }
    }

    fn model_number(&self) -> u16 {
        match self {
            InstrumentModel::Keithley2182 => 2182,
            InstrumentModel::Keithley2400 => 2400,
            InstrumentModel::Keithley6221 => 6221,
        }
    }
}

/// Role of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Reads a DC voltage.
    Voltmeter,
    /// Sources a DC current.
    CurrentSource,
    /// Sources current pulses or waveforms.
    Pulser,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentKind::Voltmeter => "voltmeter",
            InstrumentKind::CurrentSource => "current source",
            InstrumentKind::Pulser => "pulser",
        };
        f.write_str(name)
    }
}

/// An instrument lead patched into the switch matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Terminal {
    /// Connection name, e.g. "I+".
    pub name: String,
    /// Port the lead is patched into.
    pub port: SwitchPort,
}

/// A registered instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRecord {
    name: String,
    model: InstrumentModel,
    gpib_address: u8,
    simulated: bool,
    terminals: Vec<Terminal>,
}

impl InstrumentRecord {
    /// Create a record, checking the terminal count against the model.
    pub fn new(
        name: impl Into<String>,
        model: InstrumentModel,
        gpib_address: u8,
        terminals: Vec<Terminal>,
    ) -> AppResult<Self> {
        if !model.allowed_terminal_counts().contains(&terminals.len()) {
            return Err(DaqError::Configuration(format!(
                "Keithley {} supports {:?} switch connections, got {}",
                model.model_number(),
                &model.allowed_terminal_counts()[1..],
                terminals.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            model,
            gpib_address,
            simulated: false,
            terminals,
        })
    }

    /// Mark the record as backed by a simulated instrument.
    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model.
    pub fn model(&self) -> InstrumentModel {
        self.model
    }

    /// Role derived from the model.
    pub fn kind(&self) -> InstrumentKind {
        self.model.kind()
    }

    /// GPIB primary address.
    pub fn gpib_address(&self) -> u8 {
        self.gpib_address
    }

    /// Whether a simulated instrument stands in for the hardware.
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Leads patched into the switch, in registration order.
    pub fn terminals(&self) -> &[Terminal] {
        &self.terminals
    }
}

/// Network endpoint of a rig component that may be simulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host or host:port.
    pub address: String,
    /// Whether a simulated component stands in for the hardware.
    pub simulated: bool,
}

/// The entry a connection name resolved to.
#[derive(Debug, Clone, Copy)]
pub enum Owner<'a> {
    /// A rotator puck pin.
    Puck(&'a PuckConnection),
    /// An instrument terminal.
    Instrument(&'a InstrumentRecord),
}

/// Result of resolving one connection name.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    /// Switch port the connection is patched into, if any.
    pub port: Option<SwitchPort>,
    /// The puck pin or instrument the connection belongs to.
    pub owner: Owner<'a>,
}

/// Registry of every named connection on the rig.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pucks: Vec<PuckConnection>,
    instruments: Vec<InstrumentRecord>,
    ppms: Option<Endpoint>,
    switch: Option<Endpoint>,
}

impl Topology {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the cryostat endpoint.
    pub fn attach_ppms(&mut self, endpoint: Endpoint) {
        self.ppms = Some(endpoint);
    }

    /// Record the matrix switch endpoint. Only one switch is supported.
    pub fn attach_switch(&mut self, endpoint: Endpoint) {
        self.switch = Some(endpoint);
    }

    /// The cryostat endpoint, if attached.
    pub fn ppms(&self) -> Option<&Endpoint> {
        self.ppms.as_ref()
    }

    /// The switch endpoint, if attached.
    pub fn switch(&self) -> Option<&Endpoint> {
        self.switch.as_ref()
    }

    /// Whether a matrix switch is part of the rig.
    pub fn has_switch(&self) -> bool {
        self.switch.is_some()
    }

    /// Register a rotator puck pin.
    pub fn add_puck_connection(
        &mut self,
        pin: u8,
        name: impl Into<String>,
        port: Option<SwitchPort>,
    ) -> AppResult<()> {
        if port.is_some() && !self.has_switch() {
            return Err(DaqError::Configuration(
                "Add a matrix switch before defining switch labels for connections".into(),
            ));
        }
        let connection = PuckConnection::new(pin, name, port)?;
        if self.pucks.iter().any(|p| p.pin == pin) {
            return Err(DaqError::Configuration(format!(
                "Puck pin {} is already registered",
                pin
            )));
        }
        self.pucks.push(connection);
        Ok(())
    }

    /// Register an instrument.
    pub fn add_instrument(&mut self, record: InstrumentRecord) -> AppResult<()> {
        if !record.terminals.is_empty() && !self.has_switch() {
            return Err(DaqError::Configuration(
                "Add a matrix switch before defining switch labels for instruments".into(),
            ));
        }
        if self.instruments.iter().any(|i| i.name == record.name) {
            return Err(DaqError::Configuration(format!(
                "An instrument named '{}' is already registered",
                record.name
            )));
        }
        self.instruments.push(record);
        Ok(())
    }

    /// Registered puck pins, in registration order.
    pub fn puck_connections(&self) -> &[PuckConnection] {
        &self.pucks
    }

    /// Registered instruments, in registration order.
    pub fn instruments(&self) -> &[InstrumentRecord] {
        &self.instruments
    }

    /// Look up an instrument by its exact device name.
    pub fn instrument(&self, name: &str) -> AppResult<&InstrumentRecord> {
        self.instruments
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| LookupError::NotFound(name.to_string()).into())
    }

    /// Look up an instrument and check that it plays the expected role.
    pub fn instrument_of_kind(&self, name: &str, kind: InstrumentKind) -> AppResult<&InstrumentRecord> {
        let record = self.instrument(name)?;
        if record.kind() != kind {
            return Err(DaqError::Configuration(format!(
                "'{}' is a {}, expected a {}",
                name,
                record.kind(),
                kind
            )));
        }
        Ok(record)
    }

    /// Resolve a connection name to its switch port and owning entry.
    ///
    /// Puck pins and instrument terminals are searched alike; the name must
    /// match exactly one of them.
    pub fn resolve(&self, name: &str) -> AppResult<Resolved<'_>> {
        let pucks = self
            .pucks
            .iter()
            .filter(|p| p.name == name)
            .map(|p| Resolved {
                port: p.port,
                owner: Owner::Puck(p),
            });
        let terminals = self.instruments.iter().flat_map(|i| {
            i.terminals
                .iter()
                .filter(|t| t.name == name)
                .map(move |t| Resolved {
                    port: Some(t.port),
                    owner: Owner::Instrument(i),
                })
        });
        let matches: Vec<Resolved<'_>> = pucks.chain(terminals).collect();
        match matches.as_slice() {
            [] => Err(LookupError::NotFound(name.to_string()).into()),
            [only] => Ok(*only),
            _ => Err(LookupError::Ambiguous {
                name: name.to_string(),
                count: matches.len(),
            }
            .into()),
        }
    }

    /// Resolve both ends of a switch connection.
    pub fn resolve_pair(&self, first: &str, second: &str) -> AppResult<(SwitchPort, SwitchPort)> {
        Ok((self.switch_port(first)?, self.switch_port(second)?))
    }

    fn switch_port(&self, name: &str) -> AppResult<SwitchPort> {
        self.resolve(name)?.port.ok_or_else(|| {
            DaqError::Configuration(format!("Connection '{}' is not patched into the switch", name))
        })
    }

    /// The "Connection Settings" block written at the top of every data file.
    pub fn settings_header(&self) -> String {
        format!(
            "\n*********************\nConnection Settings:\n*********************\n{}\n",
            self
        )
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list of connected instruments:")?;
        write!(f, "\nPPMS IP: ")?;
        match &self.ppms {
            Some(ppms) => {
                write!(f, "{}", ppms.address)?;
                if ppms.simulated {
                    write!(f, "\nSIMULATED PPMS")?;
                }
            }
            None => write!(f, "PPMS not added")?,
        }
        write!(f, "\nSwitch IP: ")?;
        match &self.switch {
            Some(switch) => {
                write!(f, "{}", switch.address)?;
                if switch.simulated {
                    write!(f, "\nSIMULATED Switch")?;
                }
            }
            None => write!(f, "Switch not added")?,
        }
        for i in &self.instruments {
            write!(f, "\n\n\t Device Name:{}", i.name)?;
            if i.simulated {
                write!(f, "\n\tSIMULATED INSTRUMENT")?;
            }
            write!(f, "\n\t Device Type:{}", i.model.model_number())?;
            write!(f, "\n\t Device GPIB Number:{}", i.gpib_address)?;
            if !i.terminals.is_empty() {
                write!(f, "\n\t {:20}{:1} {:20}", "Connection Name", ",", "Connection Switch Label")?;
                for t in &i.terminals {
                    write!(f, "\n\t {:20}{:1} {:20}", t.name, ",", t.port.to_string())?;
                }
            }
        }

        write!(f, "\n\nlist of rotator puck connections:")?;
        write!(
            f,
            "\n\t {:20}{:1} {:20}{:1} {:20}{:1} {:20}",
            "Connection Name", ",", "Puck Pin Number", ",", "Breakout Box Number", ",", "Switch Label"
        )?;
        for p in &self.pucks {
            let port = p.port.map_or_else(|| "none".to_string(), |port| port.to_string());
            write!(
                f,
                "\n\t {:20}{:1} {:20}{:1} {:20}{:1} {:20}",
                p.name,
                ",",
                p.pin.to_string(),
                ",",
                p.breakout_box_number().to_string(),
                ",",
                port
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(c: char) -> SwitchPort {
        SwitchPort::new(c).unwrap()
    }

    fn topology_with_switch() -> Topology {
        let mut topology = Topology::new();
        topology.attach_switch(Endpoint {
            address: "192.168.0.8".into(),
            simulated: true,
        });
        topology
    }

    #[test]
    fn test_resolve_pair_of_puck_pins() {
        let mut topology = topology_with_switch();
        topology.add_puck_connection(7, "HB+", Some(port('a'))).unwrap();
        topology.add_puck_connection(8, "HB-", Some(port('b'))).unwrap();

        let (a, b) = topology.resolve_pair("HB+", "HB-").unwrap();
        assert_eq!((a.label(), b.label()), ('a', 'b'));
    }

    #[test]
    fn test_resolve_instrument_terminal_returns_owner() {
        let mut topology = topology_with_switch();
        let record = InstrumentRecord::new(
            "CurrentSource",
            InstrumentModel::Keithley2400,
            15,
            vec![
                Terminal { name: "I+".into(), port: port('p') },
                Terminal { name: "I-".into(), port: port('n') },
            ],
        )
        .unwrap();
        topology.add_instrument(record).unwrap();

        let resolved = topology.resolve("I-").unwrap();
        assert_eq!(resolved.port, Some(port('n')));
        match resolved.owner {
            Owner::Instrument(i) => assert_eq!(i.name(), "CurrentSource"),
            Owner::Puck(_) => panic!("expected an instrument owner"),
        }
    }

    #[test]
    fn test_resolve_unknown_name_is_not_found() {
        let topology = topology_with_switch();
        let err = topology.resolve("V9+").unwrap_err();
        assert!(matches!(err, DaqError::Lookup(LookupError::NotFound(ref n)) if n == "V9+"));
    }

    #[test]
    fn test_resolve_duplicate_name_is_ambiguous() {
        let mut topology = topology_with_switch();
        topology.add_puck_connection(7, "V1+", Some(port('a'))).unwrap();
        let record = InstrumentRecord::new(
            "Voltmeter",
            InstrumentModel::Keithley2182,
            17,
            vec![
                Terminal { name: "V1+".into(), port: port('k') },
                Terminal { name: "V1-".into(), port: port('l') },
            ],
        )
        .unwrap();
        topology.add_instrument(record).unwrap();

        let err = topology.resolve("V1+").unwrap_err();
        assert!(matches!(
            err,
            DaqError::Lookup(LookupError::Ambiguous { count: 2, .. })
        ));
        // the other terminal is still unique
        assert!(topology.resolve("V1-").is_ok());
    }

    #[test]
    fn test_pin_out_of_range_rejected() {
        let mut topology = topology_with_switch();
        assert!(topology.add_puck_connection(6, "X", None).is_err());
        assert!(topology.add_puck_connection(15, "X", None).is_err());
        assert!(topology.add_puck_connection(14, "X", None).is_ok());
    }

    #[test]
    fn test_puck_port_must_be_top_row() {
        let mut topology = topology_with_switch();
        let err = topology.add_puck_connection(9, "HBR1", Some(port('k'))).unwrap_err();
        assert!(err.to_string().contains("top row"));
        assert!(SwitchPort::new('z').is_err());
    }

    #[test]
    fn test_switch_labels_require_switch() {
        let mut topology = Topology::new();
        assert!(topology.add_puck_connection(7, "HB+", Some(port('a'))).is_err());
        assert!(topology.add_puck_connection(7, "HB+", None).is_ok());
    }

    #[test]
    fn test_duplicate_pins_and_instruments_rejected() {
        let mut topology = topology_with_switch();
        topology.add_puck_connection(7, "HB+", None).unwrap();
        assert!(topology.add_puck_connection(7, "HB-", None).is_err());

        let vm = InstrumentRecord::new("Voltmeter", InstrumentModel::Keithley2182, 17, vec![]).unwrap();
        topology.add_instrument(vm.clone()).unwrap();
        assert!(topology.add_instrument(vm).is_err());
    }

    #[test]
    fn test_terminal_count_checked_per_model() {
        let three = (0..3)
            .map(|i| Terminal {
                name: format!("T{}", i),
                port: port('i'),
            })
            .collect::<Vec<_>>();
        assert!(InstrumentRecord::new("CS", InstrumentModel::Keithley2400, 15, three).is_err());
    }

    #[test]
    fn test_instrument_lookup_is_exact() {
        let mut topology = topology_with_switch();
        let vm = InstrumentRecord::new("Voltmeter2", InstrumentModel::Keithley2182, 17, vec![]).unwrap();
        topology.add_instrument(vm).unwrap();
        assert!(topology.instrument("Voltmeter").is_err());
        assert!(topology
            .instrument_of_kind("Voltmeter2", InstrumentKind::CurrentSource)
            .is_err());
    }

    #[test]
    fn test_settings_header_lists_connections() {
        let mut topology = topology_with_switch();
        topology.add_puck_connection(7, "HB+", Some(port('a'))).unwrap();
        let header = topology.settings_header();
        assert!(header.contains("Connection Settings:"));
        assert!(header.contains("HB+"));
        assert!(header.contains("SIMULATED Switch"));
    }
}
