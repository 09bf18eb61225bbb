use std::fmt::{Display, Formatter};

use anyhow::anyhow;

/// The command name at the start of a protocol line. The set of verbs the server may send is
///  open-ended (and grows with protocol revisions), so unknown verbs are carried verbatim in
///  [`Verb::Other`] rather than rejected - an unsupported verb must never break the connection.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Verb {
    Msg,
    Ubx,
    Ubn,
    Ubm,
    Uun,
    Uux,
    Adl,
    Rml,
    Fqy,
    Gcf,
    Qry,
    Not,
    Pag,
    Ipg,
    Chg,
    Png,
    Qng,
    Out,
    Other(String),
}

impl Verb {
    pub fn from_wire(raw: &str) -> Verb {
        match raw {
            "MSG" => Verb::Msg,
            "UBX" => Verb::Ubx,
            "UBN" => Verb::Ubn,
            "UBM" => Verb::Ubm,
            "UUN" => Verb::Uun,
            "UUX" => Verb::Uux,
            "ADL" => Verb::Adl,
            "RML" => Verb::Rml,
            "FQY" => Verb::Fqy,
            "GCF" => Verb::Gcf,
            "QRY" => Verb::Qry,
            "NOT" => Verb::Not,
            "PAG" => Verb::Pag,
            "IPG" => Verb::Ipg,
            "CHG" => Verb::Chg,
            "PNG" => Verb::Png,
            "QNG" => Verb::Qng,
            "OUT" => Verb::Out,
            _ => Verb::Other(raw.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Verb::Msg => "MSG",
            Verb::Ubx => "UBX",
            Verb::Ubn => "UBN",
            Verb::Ubm => "UBM",
            Verb::Uun => "UUN",
            Verb::Uux => "UUX",
            Verb::Adl => "ADL",
            Verb::Rml => "RML",
            Verb::Fqy => "FQY",
            Verb::Gcf => "GCF",
            Verb::Qry => "QRY",
            Verb::Not => "NOT",
            Verb::Pag => "PAG",
            Verb::Ipg => "IPG",
            Verb::Chg => "CHG",
            Verb::Png => "PNG",
            Verb::Qng => "QNG",
            Verb::Out => "OUT",
            Verb::Other(s) => s,
        }
    }

    /// For payload-bearing verbs: the index of the parameter that declares the payload byte
    ///  count. The index is fixed per verb because the preceding parameters are fixed per verb
    ///  (sender / network / type prefixes).
    fn payload_len_index(&self) -> Option<usize> {
        match self {
            Verb::Not | Verb::Pag | Verb::Ipg => Some(0),
            Verb::Uux | Verb::Adl | Verb::Rml | Verb::Fqy | Verb::Gcf | Verb::Qry => Some(1),
            Verb::Msg | Verb::Ubx | Verb::Ubn => Some(2),
            Verb::Ubm | Verb::Uun => Some(3),
            _ => None,
        }
    }

    /// Verbs whose payload is a MIME message from a remote user (as opposed to list / config
    ///  blobs); for these the first parameter is the sender's passport.
    pub fn is_message_bearing(&self) -> bool {
        matches!(self, Verb::Msg | Verb::Ubm | Verb::Ubn | Verb::Ubx)
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// One parsed protocol line. Immutable once parsed; consumed by the dispatcher, which retains
///  at most the last command for payload attachment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    pub verb: Verb,
    pub params: Vec<String>,
    pub transaction_id: Option<u32>,
    pub declared_payload_len: usize,
}

impl Command {
    /// Upper bound for a declared payload length. The value on the wire is trusted but
    ///  bounds-checked so a hostile peer cannot make us buffer without limit.
    pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

    pub fn parse(line: &str) -> anyhow::Result<Command> {
        let line = line.strip_suffix("\r\n").unwrap_or(line);
        if line.is_empty() {
            return Err(anyhow!("empty command line"));
        }

        let (raw_verb, remainder) = match line.split_once(' ') {
            Some((v, r)) => (v, r),
            None => (line, ""),
        };
        let verb = Verb::from_wire(raw_verb);

        let params: Vec<String> = if remainder.is_empty() {
            Vec::new()
        }
        else {
            remainder.split(' ').map(str::to_string).collect()
        };

        // The first parameter is the transaction id iff it is purely decimal digits. Server
        //  push notifications (presence etc.) have a non-numeric first token and are not
        //  correlated to outstanding transactions.
        let transaction_id = params.first()
            .filter(|p| is_all_digits(p))
            .and_then(|p| p.parse::<u32>().ok());

        let declared_payload_len = verb.payload_len_index()
            .and_then(|idx| params.get(idx))
            .and_then(|p| p.parse::<usize>().ok())
            .unwrap_or(0);

        if declared_payload_len > Self::MAX_PAYLOAD_LEN {
            return Err(anyhow!("command {} declares a payload of {} bytes, exceeding the limit of {}",
                verb, declared_payload_len, Self::MAX_PAYLOAD_LEN));
        }

        Ok(Command {
            verb,
            params,
            transaction_id,
            declared_payload_len,
        })
    }

    /// An all-digits verb is a server error reply carrying the numeric error code.
    pub fn error_code(&self) -> Option<u32> {
        match &self.verb {
            Verb::Other(s) if is_all_digits(s) => s.parse::<u32>().ok(),
            _ => None,
        }
    }

    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }
}
