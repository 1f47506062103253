//! Command surface
//! Parses console / chat lines into engine requests

use std::collections::HashMap;
use thiserror::Error;

use crate::api::{Instrument, Side};
use crate::config::PreferenceUpdates;
use crate::trading::OpenRequest;

/// Command parse errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0} (try /help)")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Invalid percentage {0:?}: expected a number between 0 and 100")]
    InvalidPercentage(String),

    #[error("Unknown symbol {0}: /search for it first, or give EXCH:TOKEN:SYMBOL")]
    UnknownSymbol(String),
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Open(OpenRequest),
    Modify {
        position_ref: String,
        stop_loss_pct: Option<f64>,
        target_pct: Option<f64>,
    },
    Exit {
        position_ref: String,
    },
    Cancel {
        position_ref: String,
    },
    Status,
    Search {
        text: String,
    },
    /// Empty updates mean "show current preferences"
    Preferences(PreferenceUpdates),
    Tick {
        instrument_key: String,
        price: f64,
    },
    Help,
}

pub const HELP: &str = "\
/search NAME
/long SYMBOL|EXCH:TOKEN:SYMBOL [qty=N | capital=X] [sl=P] [tgt=P] [limit=PRICE]
/short SYMBOL|EXCH:TOKEN:SYMBOL [qty=N | capital=X] [sl=P] [tgt=P] [limit=PRICE]
/modify ORDER_REF [sl=P] [tgt=P]
/exit ORDER_REF
/cancel ORDER_REF
/status
/prefs [capital=X] [sl=P] [tgt=P]
/tick SYMBOL|EXCH:TOKEN PRICE
/help";

/// Parse a percentage such as `0.5`, `0.5%` or `0.5 %`
pub fn parse_percentage(text: &str) -> Result<f64, CommandError> {
    let trimmed = text.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && (0.0..=100.0).contains(&value) => Ok(value),
        _ => Err(CommandError::InvalidPercentage(text.to_string())),
    }
}

/// Instruments from the most recent search, keyed by trading symbol
#[derive(Debug, Clone, Default)]
pub struct SymbolBook {
    by_symbol: HashMap<String, Instrument>,
}

impl SymbolBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the book with a fresh set of search results
    pub fn remember(&mut self, instruments: &[Instrument]) {
        self.by_symbol = instruments
            .iter()
            .map(|i| (i.symbol.to_uppercase(), i.clone()))
            .collect();
    }

    pub fn resolve(&self, symbol: &str) -> Option<&Instrument> {
        self.by_symbol.get(&symbol.to_uppercase())
    }
}

/// Parse one command line; bare symbols must be spelled `EXCH:TOKEN:SYMBOL`
pub fn parse_intent(line: &str) -> Result<Intent, CommandError> {
    parse_intent_with(line, &SymbolBook::default())
}

/// Parse one command line, resolving bare symbols from earlier search results
pub fn parse_intent_with(line: &str, book: &SymbolBook) -> Result<Intent, CommandError> {
    let mut words = line.split_whitespace();
    let command = words.next().ok_or(CommandError::Empty)?;
    let args: Vec<&str> = words.collect();

    match command.to_lowercase().as_str() {
        "/long" | "/buy" => parse_open(Side::Long, &args, book),
        "/short" | "/sell" => parse_open(Side::Short, &args, book),
        "/modify" => {
            let position_ref = order_ref(&args)?;
            let options = Options::parse(&args[1..])?;
            if options.stop_loss_pct.is_none() && options.target_pct.is_none() {
                return Err(CommandError::MissingArgument("sl= or tgt="));
            }
            Ok(Intent::Modify {
                position_ref,
                stop_loss_pct: options.stop_loss_pct,
                target_pct: options.target_pct,
            })
        }
        "/exit" => Ok(Intent::Exit {
            position_ref: order_ref(&args)?,
        }),
        "/cancel" => Ok(Intent::Cancel {
            position_ref: order_ref(&args)?,
        }),
        "/status" => Ok(Intent::Status),
        "/search" | "/s" => {
            if args.is_empty() {
                return Err(CommandError::MissingArgument("name"));
            }
            Ok(Intent::Search { text: args.join(" ") })
        }
        "/prefs" => {
            let options = Options::parse(&args)?;
            let mut updates = PreferenceUpdates::new();
            updates.capital = options.capital;
            updates.stop_loss_pct = options.stop_loss_pct;
            updates.target_pct = options.target_pct;
            Ok(Intent::Preferences(updates))
        }
        "/tick" => {
            let instrument = args.first().ok_or(CommandError::MissingArgument("instrument"))?;
            let instrument_key = tick_key(instrument, book)?;
            let raw = args.get(1).ok_or(CommandError::MissingArgument("price"))?;
            let price = positive(raw, "price")?;
            Ok(Intent::Tick { instrument_key, price })
        }
        "/help" | "/start" => Ok(Intent::Help),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn parse_open(side: Side, args: &[&str], book: &SymbolBook) -> Result<Intent, CommandError> {
    let raw = args.first().ok_or(CommandError::MissingArgument("instrument"))?;
    let instrument = parse_instrument(raw, book)?;
    let options = Options::parse(&args[1..])?;

    let mut request = OpenRequest::market(instrument, side);
    match (options.quantity, options.capital) {
        (Some(_), Some(_)) => {
            return Err(CommandError::InvalidValue {
                field: "sizing",
                value: "use either qty= or capital=".to_string(),
            })
        }
        (Some(quantity), None) => request = request.quantity(quantity),
        (None, Some(capital)) => request = request.capital(capital),
        (None, None) => {}
    }
    request.stop_loss_pct = options.stop_loss_pct;
    request.target_pct = options.target_pct;
    if let Some(price) = options.limit {
        request = request.limit(price);
    }
    Ok(Intent::Open(request))
}

/// `EXCH:TOKEN:SYMBOL` (the symbol defaults to the token) or a searched symbol
fn parse_instrument(raw: &str, book: &SymbolBook) -> Result<Instrument, CommandError> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [symbol] if !symbol.is_empty() => book
            .resolve(symbol)
            .cloned()
            .ok_or_else(|| CommandError::UnknownSymbol(symbol.to_string())),
        [exchange, token, symbol] if !exchange.is_empty() && !token.is_empty() && !symbol.is_empty() => {
            Ok(Instrument::new(exchange, token, symbol))
        }
        [exchange, token] if !exchange.is_empty() && !token.is_empty() => {
            Ok(Instrument::new(exchange, token, token))
        }
        _ => Err(CommandError::InvalidValue {
            field: "instrument",
            value: raw.to_string(),
        }),
    }
}

/// Feed key from `EXCH:TOKEN[:SYMBOL]` or `EXCH|TOKEN`
fn tick_key(raw: &str, book: &SymbolBook) -> Result<String, CommandError> {
    if let Some((exchange, token)) = raw.split_once('|') {
        if !exchange.is_empty() && !token.is_empty() {
            return Ok(format!("{}|{}", exchange.to_uppercase(), token));
        }
    }
    parse_instrument(raw, book).map(|instrument| instrument.key())
}

fn order_ref(args: &[&str]) -> Result<String, CommandError> {
    args.first()
        .map(|s| s.to_string())
        .ok_or(CommandError::MissingArgument("order reference"))
}

fn positive(raw: &str, field: &'static str) -> Result<f64, CommandError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(CommandError::InvalidValue {
            field,
            value: raw.to_string(),
        }),
    }
}

/// `key=value` options shared by several commands
#[derive(Debug, Default)]
struct Options {
    quantity: Option<u32>,
    capital: Option<f64>,
    stop_loss_pct: Option<f64>,
    target_pct: Option<f64>,
    limit: Option<f64>,
}

impl Options {
    fn parse(args: &[&str]) -> Result<Self, CommandError> {
        let mut options = Self::default();
        let mut pending: Option<(&str, String)> = None;

        for arg in args {
            // `sl=0.5 %` arrives as two words
            if *arg == "%" {
                if let Some((_, value)) = pending.as_mut() {
                    value.push('%');
                    continue;
                }
            }
            if let Some((key, value)) = pending.take() {
                options.set(key, &value)?;
            }
            let (key, value) = arg.split_once('=').ok_or_else(|| CommandError::InvalidValue {
                field: "option",
                value: arg.to_string(),
            })?;
            pending = Some((key, value.to_string()));
        }
        if let Some((key, value)) = pending {
            options.set(key, &value)?;
        }
        Ok(options)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), CommandError> {
        match key.to_lowercase().as_str() {
            "qty" | "quantity" => {
                let quantity = value.parse::<u32>().ok().filter(|q| *q > 0).ok_or_else(|| {
                    CommandError::InvalidValue {
                        field: "quantity",
                        value: value.to_string(),
                    }
                })?;
                self.quantity = Some(quantity);
            }
            "capital" => self.capital = Some(positive(value, "capital")?),
            "sl" | "stoploss" => self.stop_loss_pct = Some(parse_percentage(value)?),
            "tgt" | "target" => self.target_pct = Some(parse_percentage(value)?),
            "limit" | "price" => self.limit = Some(positive(value, "limit price")?),
            _ => {
                return Err(CommandError::InvalidValue {
                    field: "option",
                    value: format!("{}={}", key, value),
                })
            }
        }
        Ok(())
    }
}
