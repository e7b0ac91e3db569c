//! Per-replica launch configuration and its command line encodings.
//!
//! A replica server accepts its configuration in one of two shapes:
//!
//! - positional: `<my_addr> <my_paxos> [<peer> ...]`
//! - text format: a single argument such as
//!   `my_addr:'0.0.0.0:8000' my_paxos:'0.0.0.0:9000' fail_rate:0.3
//!    replica:'0.0.0.0:9000' replica:'0.0.0.0:9001'`, where every peer
//!   address carries its own `replica` label.

use std::fmt;
use std::iter::Peekable;
use std::net::SocketAddr;
use std::str::Chars;

use crate::utils::PaxbootError;

use serde::Deserialize;

/// Encoding of a `ReplicaConfig` on the child's command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Discrete arguments; cannot carry a failure rate.
    Positional,

    /// One text-format argument with named fields.
    TextFormat,
}

impl PayloadFormat {
    /// Parse command line string into `PayloadFormat` enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "positional" | "Positional" => Some(Self::Positional),
            "text_format" | "TextFormat" => Some(Self::TextFormat),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Positional => write!(f, "positional"),
            Self::TextFormat => write!(f, "text_format"),
        }
    }
}

/// Launch-time configuration handed to one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaConfig {
    /// Own client-facing address.
    pub my_addr: SocketAddr,

    /// Own peer-peer address.
    pub my_paxos: SocketAddr,

    /// Failure-injection rate; `None` means no injected failures.
    pub fail_rate: Option<f64>,

    /// Ordered peer addresses the replica should connect to.
    pub replicas: Vec<SocketAddr>,
}

impl ReplicaConfig {
    /// Encodes into child process arguments (executable excluded).
    pub fn to_args(
        &self,
        format: PayloadFormat,
    ) -> Result<Vec<String>, PaxbootError> {
        match format {
            PayloadFormat::Positional => {
                if let Some(rate) = self.fail_rate {
                    return Err(PaxbootError::msg(format!(
                        "positional payload cannot carry fail_rate {}",
                        rate
                    )));
                }
                let mut args =
                    vec![self.my_addr.to_string(), self.my_paxos.to_string()];
                args.extend(self.replicas.iter().map(|a| a.to_string()));
                Ok(args)
            }
            PayloadFormat::TextFormat => Ok(vec![self.to_text()]),
        }
    }

    /// Decodes from child process arguments (executable excluded).
    pub fn from_args(
        format: PayloadFormat,
        args: &[String],
    ) -> Result<Self, PaxbootError> {
        match format {
            PayloadFormat::Positional => {
                if args.len() < 2 {
                    return Err(PaxbootError::msg(format!(
                        "positional payload needs at least 2 args, got {}",
                        args.len()
                    )));
                }
                Ok(ReplicaConfig {
                    my_addr: args[0].parse::<SocketAddr>()?,
                    my_paxos: args[1].parse::<SocketAddr>()?,
                    fail_rate: None,
                    replicas: args[2..]
                        .iter()
                        .map(|a| a.parse::<SocketAddr>())
                        .collect::<Result<_, _>>()?,
                })
            }
            PayloadFormat::TextFormat => match args {
                [text] => Self::from_text(text),
                _ => Err(PaxbootError::msg(format!(
                    "text_format payload needs exactly 1 arg, got {}",
                    args.len()
                ))),
            },
        }
    }

    /// Renders the text-format blob.
    pub fn to_text(&self) -> String {
        let mut fields = vec![
            format!("my_addr:{}", quoted(&self.my_addr.to_string())),
            format!("my_paxos:{}", quoted(&self.my_paxos.to_string())),
        ];
        if let Some(rate) = self.fail_rate {
            fields.push(format!("fail_rate:{}", rate));
        }
        for replica in &self.replicas {
            fields.push(format!("replica:{}", quoted(&replica.to_string())));
        }
        fields.join(" ")
    }

    /// Parses a text-format blob.
    pub fn from_text(text: &str) -> Result<Self, PaxbootError> {
        let mut my_addr: Option<SocketAddr> = None;
        let mut my_paxos: Option<SocketAddr> = None;
        let mut fail_rate: Option<f64> = None;
        let mut replicas: Vec<SocketAddr> = vec![];

        for field in TextFields::new(text) {
            let (name, value) = field?;
            match name.as_str() {
                "my_addr" => {
                    let addr = value.string()?.parse::<SocketAddr>()?;
                    set_once(&mut my_addr, &name, addr)?;
                }
                "my_paxos" => {
                    let addr = value.string()?.parse::<SocketAddr>()?;
                    set_once(&mut my_paxos, &name, addr)?;
                }
                "fail_rate" => {
                    let rate = value.bare()?.parse::<f64>()?;
                    set_once(&mut fail_rate, &name, rate)?;
                }
                "replica" => {
                    replicas.push(value.string()?.parse::<SocketAddr>()?);
                }
                _ => {
                    return Err(PaxbootError::msg(format!(
                        "unknown field '{}' in text payload",
                        name
                    )))
                }
            }
        }

        Ok(ReplicaConfig {
            my_addr: my_addr.ok_or_else(|| missing("my_addr"))?,
            my_paxos: my_paxos.ok_or_else(|| missing("my_paxos"))?,
            fail_rate,
            replicas,
        })
    }
}

/// Single-quotes a string value, escaping backslashes and single quotes.
fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn set_once<T>(
    slot: &mut Option<T>,
    name: &str,
    value: T,
) -> Result<(), PaxbootError> {
    if slot.is_some() {
        return Err(PaxbootError::msg(format!(
            "duplicate field '{}' in text payload",
            name
        )));
    }
    *slot = Some(value);
    Ok(())
}

fn missing(name: &str) -> PaxbootError {
    PaxbootError::msg(format!("missing field '{}' in text payload", name))
}

/// A field value as written: quoted string or bare scalar.
#[derive(Debug, PartialEq)]
enum FieldValue {
    Quoted(String),
    Bare(String),
}

impl FieldValue {
    fn string(self) -> Result<String, PaxbootError> {
        match self {
            Self::Quoted(s) => Ok(s),
            Self::Bare(s) => Err(PaxbootError::msg(format!(
                "expected quoted string: {}",
                s
            ))),
        }
    }

    fn bare(self) -> Result<String, PaxbootError> {
        match self {
            Self::Bare(s) => Ok(s),
            Self::Quoted(s) => Err(PaxbootError::msg(format!(
                "unexpected quoted value: {}",
                s
            ))),
        }
    }
}

/// Iterator over `name:value` fields of a text-format blob.
struct TextFields<'t> {
    chars: Peekable<Chars<'t>>,
    failed: bool,
}

impl<'t> TextFields<'t> {
    fn new(text: &'t str) -> Self {
        TextFields {
            chars: text.chars().peekable(),
            failed: false,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn next_field(&mut self) -> Result<(String, FieldValue), PaxbootError> {
        let mut name = String::new();
        while let Some(c) =
            self.chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_')
        {
            name.push(c);
        }
        if name.is_empty() {
            return Err(PaxbootError::msg(format!(
                "expected field name, found {:?}",
                self.chars.peek()
            )));
        }
        if self.chars.next() != Some(':') {
            return Err(PaxbootError::msg(format!(
                "expected ':' after field name '{}'",
                name
            )));
        }
        self.skip_whitespace();

        let value = match self.chars.peek().copied() {
            Some(quote @ ('\'' | '"')) => {
                self.chars.next();
                FieldValue::Quoted(self.quoted_value(quote, &name)?)
            }
            _ => {
                let mut value = String::new();
                while let Some(c) = self.chars.next_if(|c| !c.is_whitespace())
                {
                    value.push(c);
                }
                if value.is_empty() {
                    return Err(PaxbootError::msg(format!(
                        "missing value for field '{}'",
                        name
                    )));
                }
                FieldValue::Bare(value)
            }
        };
        Ok((name, value))
    }

    fn quoted_value(
        &mut self,
        quote: char,
        name: &str,
    ) -> Result<String, PaxbootError> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('\\') => match self.chars.next() {
                    Some(c) => value.push(c),
                    None => break,
                },
                Some(c) if c == quote => return Ok(value),
                Some(c) => value.push(c),
                None => break,
            }
        }
        Err(PaxbootError::msg(format!(
            "unterminated quote in field '{}'",
            name
        )))
    }
}

impl Iterator for TextFields<'_> {
    type Item = Result<(String, FieldValue), PaxbootError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.skip_whitespace();
        self.chars.peek()?;
        let field = self.next_field();
        self.failed = field.is_err();
        Some(field)
    }
}

#[cfg(test)]
mod payload_tests {
    use super::*;
    use crate::topology::{PeerPolicy, Topology};
    use std::net::{IpAddr, Ipv4Addr};

    const ANY: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    fn config_of(
        topo: &Topology,
        id: u8,
        fail_rate: Option<f64>,
        policy: PeerPolicy,
    ) -> Result<ReplicaConfig, PaxbootError> {
        let addrs = topo.addrs(id)?;
        Ok(ReplicaConfig {
            my_addr: addrs.client,
            my_paxos: addrs.peer,
            fail_rate,
            replicas: topo.peers(id, policy)?,
        })
    }

    #[test]
    fn text_format_five_replicas() -> Result<(), PaxbootError> {
        let topo = Topology::allocate(5, ANY, 8000, 9000)?;
        let config = config_of(&topo, 2, Some(0.3), PeerPolicy::IncludeSelf)?;
        let args = config.to_args(PayloadFormat::TextFormat)?;
        assert_eq!(args.len(), 1);
        assert_eq!(
            args[0],
            "my_addr:'0.0.0.0:8002' my_paxos:'0.0.0.0:9002' fail_rate:0.3 \
             replica:'0.0.0.0:9000' replica:'0.0.0.0:9001' \
             replica:'0.0.0.0:9002' replica:'0.0.0.0:9003' \
             replica:'0.0.0.0:9004'"
        );
        Ok(())
    }

    #[test]
    fn text_format_no_fail_rate() -> Result<(), PaxbootError> {
        let topo = Topology::allocate(2, ANY, 8000, 9000)?;
        let config = config_of(&topo, 1, None, PeerPolicy::ExcludeSelf)?;
        assert_eq!(
            config.to_text(),
            "my_addr:'0.0.0.0:8001' my_paxos:'0.0.0.0:9001' \
             replica:'0.0.0.0:9000'"
        );
        Ok(())
    }

    #[test]
    fn positional_three_replicas() -> Result<(), PaxbootError> {
        let topo = Topology::allocate(3, ANY, 8000, 9000)?;
        let config = config_of(&topo, 0, None, PeerPolicy::ExcludeSelf)?;
        assert_eq!(
            config.to_args(PayloadFormat::Positional)?,
            vec!["0.0.0.0:8000", "0.0.0.0:9000", "0.0.0.0:9001", "0.0.0.0:9002"]
        );
        Ok(())
    }

    #[test]
    fn positional_rejects_fail_rate() -> Result<(), PaxbootError> {
        let topo = Topology::allocate(3, ANY, 8000, 9000)?;
        let config = config_of(&topo, 0, Some(0.1), PeerPolicy::ExcludeSelf)?;
        assert!(config.to_args(PayloadFormat::Positional).is_err());
        Ok(())
    }

    #[test]
    fn parse_recovers_config() -> Result<(), PaxbootError> {
        for n in [1, 2, 5] {
            let topo = Topology::allocate(n, ANY, 8000, 9000)?;
            for (id, _) in topo.iter() {
                let config =
                    config_of(&topo, id, Some(0.25), PeerPolicy::IncludeSelf)?;
                let args = config.to_args(PayloadFormat::TextFormat)?;
                assert_eq!(
                    ReplicaConfig::from_args(PayloadFormat::TextFormat, &args)?,
                    config
                );

                let config =
                    config_of(&topo, id, None, PeerPolicy::ExcludeSelf)?;
                let args = config.to_args(PayloadFormat::Positional)?;
                assert_eq!(
                    ReplicaConfig::from_args(PayloadFormat::Positional, &args)?,
                    config
                );
            }
        }
        Ok(())
    }

    #[test]
    fn parse_lenient_spacing_and_quotes() -> Result<(), PaxbootError> {
        let config = ReplicaConfig::from_text(
            "  my_paxos: \"127.0.0.1:9000\"\n my_addr:'127.0.0.1:8000'\t\
             replica: '127.0.0.1:9001' fail_rate:0 ",
        )?;
        assert_eq!(config.my_addr, "127.0.0.1:8000".parse::<SocketAddr>()?);
        assert_eq!(config.my_paxos, "127.0.0.1:9000".parse::<SocketAddr>()?);
        assert_eq!(config.fail_rate, Some(0.0));
        assert_eq!(
            config.replicas,
            vec!["127.0.0.1:9001".parse::<SocketAddr>()?]
        );
        Ok(())
    }

    #[test]
    fn parse_invalid_text() {
        for text in [
            "",
            "my_addr:'0.0.0.0:8000'",
            "my_addr:'0.0.0.0:8000' my_paxos:'0.0.0.0:9000' bogus:'x'",
            "my_addr:'0.0.0.0:8000' my_addr:'0.0.0.0:8001' \
             my_paxos:'0.0.0.0:9000'",
            "my_addr:'0.0.0.0:8000' my_paxos:'0.0.0.0:9000",
            "my_addr:0.0.0.0:8000 my_paxos:'0.0.0.0:9000'",
            "my_addr:'0.0.0.0:8000' my_paxos:'0.0.0.0:9000' fail_rate:'0.3'",
            "my_addr:'0.0.0.0:8000' my_paxos:'0.0.0.0:9000' fail_rate:high",
            "my_addr:'0.0.0.0:8000' my_paxos:'0.0.0.0:9000' replica:",
            "my_addr '0.0.0.0:8000'",
            "my_addr:'not an address' my_paxos:'0.0.0.0:9000'",
        ] {
            assert!(ReplicaConfig::from_text(text).is_err(), "{}", text);
        }
    }

    #[test]
    fn parse_invalid_args() {
        assert!(ReplicaConfig::from_args(
            PayloadFormat::Positional,
            &["0.0.0.0:8000".into()]
        )
        .is_err());
        assert!(ReplicaConfig::from_args(PayloadFormat::TextFormat, &[])
            .is_err());
    }

    #[test]
    fn quote_escaping() {
        assert_eq!(quoted("a'b\\c"), "'a\\'b\\\\c'");
        let mut fields = TextFields::new("x:'a\\'b\\\\c'");
        assert_eq!(
            fields.next(),
            Some(Ok(("x".into(), FieldValue::Quoted("a'b\\c".into()))))
        );
        assert_eq!(fields.next(), None);
    }

    #[test]
    fn format_names() {
        assert_eq!(
            PayloadFormat::parse_name("text_format"),
            Some(PayloadFormat::TextFormat)
        );
        assert_eq!(
            PayloadFormat::parse_name("Positional"),
            Some(PayloadFormat::Positional)
        );
        assert_eq!(PayloadFormat::parse_name("json"), None);
        assert_eq!(PayloadFormat::Positional.to_string(), "positional");
    }
}
