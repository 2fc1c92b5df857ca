//! Span context propagation across process boundaries.
//!
//! Two formats ship with the crate: [`TEXT_MAP`] writes string key/value
//! pairs into any [`TextMapWriter`] (HTTP headers, message metadata), and
//! [`BINARY`] writes a compact big-endian byte stream into any
//! [`std::io::Write`]. Additional formats can be registered on a
//! [`PropagationRegistry`] before the tracer is shared between threads.

use crate::context::SpanContext;
use crate::error::Error;
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Name of the text-map propagation format.
pub const TEXT_MAP: &str = "text-map";
/// Name of the binary propagation format.
pub const BINARY: &str = "binary";

const KEY_TRACE_ID: &str = "tracekit-traceid";
const KEY_SPAN_ID: &str = "tracekit-spanid";
const KEY_PARENT_SPAN_ID: &str = "tracekit-parentspanid";
const KEY_FLAGS: &str = "tracekit-flags";
const BAGGAGE_PREFIX: &str = "tracekit-baggage-";

/// Write half of a text-map carrier.
pub trait TextMapWriter {
    fn set(&mut self, key: &str, value: String);
}

/// Read half of a text-map carrier. Key matching is the codec's concern;
/// carriers report entries as they hold them.
pub trait TextMapReader {
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_>;
}

impl TextMapWriter for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_owned(), value);
    }
}

impl TextMapReader for HashMap<String, String> {
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        Box::new(self.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// A carrier a span context can be injected into.
pub enum InjectCarrier<'a> {
    TextMap(&'a mut dyn TextMapWriter),
    Binary(&'a mut dyn Write),
}

/// A carrier a span context can be extracted from.
pub enum ExtractCarrier<'a> {
    TextMap(&'a dyn TextMapReader),
    Binary(&'a mut dyn Read),
}

/// Injects a [`SpanContext`] into a carrier.
pub trait Injecter: Send + Sync {
    fn inject(&self, context: &SpanContext, carrier: &mut InjectCarrier<'_>) -> Result<(), Error>;
}

/// Extracts a [`SpanContext`] from a carrier.
pub trait Extracter: Send + Sync {
    fn extract(&self, carrier: &mut ExtractCarrier<'_>) -> Result<SpanContext, Error>;
}

/// Maps format names to their codecs.
///
/// The default registry knows [`TEXT_MAP`] and [`BINARY`]. Registration is
/// meant to happen at startup, before the owning tracer is cloned across
/// threads.
pub struct PropagationRegistry {
    injecters: HashMap<String, Box<dyn Injecter>>,
    extracters: HashMap<String, Box<dyn Extracter>>,
}

impl Default for PropagationRegistry {
    fn default() -> Self {
        let mut registry = PropagationRegistry {
            injecters: HashMap::new(),
            extracters: HashMap::new(),
        };
        registry.register_injecter(TEXT_MAP, Box::new(TextMapCodec));
        registry.register_extracter(TEXT_MAP, Box::new(TextMapCodec));
        registry.register_injecter(BINARY, Box::new(BinaryCodec));
        registry.register_extracter(BINARY, Box::new(BinaryCodec));
        registry
    }
}

impl PropagationRegistry {
    /// A registry with no formats at all.
    pub fn empty() -> Self {
        PropagationRegistry {
            injecters: HashMap::new(),
            extracters: HashMap::new(),
        }
    }

    pub fn register_injecter(&mut self, format: impl Into<String>, injecter: Box<dyn Injecter>) {
        self.injecters.insert(format.into(), injecter);
    }

    pub fn register_extracter(&mut self, format: impl Into<String>, extracter: Box<dyn Extracter>) {
        self.extracters.insert(format.into(), extracter);
    }

    pub fn inject(
        &self,
        context: &SpanContext,
        format: &str,
        carrier: &mut InjectCarrier<'_>,
    ) -> Result<(), Error> {
        let injecter = self
            .injecters
            .get(format)
            .ok_or_else(|| Error::UnsupportedFormat(format.to_owned()))?;
        injecter.inject(context, carrier)
    }

    pub fn extract(
        &self,
        format: &str,
        carrier: &mut ExtractCarrier<'_>,
    ) -> Result<SpanContext, Error> {
        let extracter = self
            .extracters
            .get(format)
            .ok_or_else(|| Error::UnsupportedFormat(format.to_owned()))?;
        extracter.extract(carrier)
    }
}

fn id_to_hex(id: u64) -> String {
    format!("{id:016x}")
}

fn id_from_hex(s: &str) -> u64 {
    u64::from_str_radix(s, 16).unwrap_or(0)
}

/// The [`TEXT_MAP`] codec.
///
/// Ids are written as 16 lowercase hex characters, flags as a decimal
/// integer, and each baggage item under [`BAGGAGE_PREFIX`]. Extraction
/// matches key names case-insensitively; baggage keys keep the case the
/// carrier holds them in.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextMapCodec;

impl Injecter for TextMapCodec {
    fn inject(&self, context: &SpanContext, carrier: &mut InjectCarrier<'_>) -> Result<(), Error> {
        let writer = match carrier {
            InjectCarrier::TextMap(writer) => writer,
            _ => return Err(Error::InvalidCarrier),
        };
        writer.set(KEY_TRACE_ID, id_to_hex(context.trace_id()));
        writer.set(KEY_SPAN_ID, id_to_hex(context.span_id()));
        writer.set(KEY_PARENT_SPAN_ID, id_to_hex(context.parent_id()));
        writer.set(KEY_FLAGS, context.flags().to_string());
        for (key, value) in context.baggage() {
            writer.set(&format!("{BAGGAGE_PREFIX}{key}"), value.clone());
        }
        Ok(())
    }
}

impl Extracter for TextMapCodec {
    fn extract(&self, carrier: &mut ExtractCarrier<'_>) -> Result<SpanContext, Error> {
        let reader = match carrier {
            ExtractCarrier::TextMap(reader) => reader,
            _ => return Err(Error::InvalidCarrier),
        };
        let mut trace_id = 0;
        let mut span_id = 0;
        let mut parent_id = 0;
        let mut flags = 0;
        let mut baggage = HashMap::new();
        for (key, value) in reader.entries() {
            let lower = key.to_ascii_lowercase();
            match lower.as_str() {
                KEY_TRACE_ID => trace_id = id_from_hex(value),
                KEY_SPAN_ID => span_id = id_from_hex(value),
                KEY_PARENT_SPAN_ID => parent_id = id_from_hex(value),
                KEY_FLAGS => flags = value.parse().unwrap_or(0),
                _ => {
                    if lower.starts_with(BAGGAGE_PREFIX) {
                        // The prefix is ASCII, so slicing the original key
                        // by its length is safe and keeps the key's case.
                        baggage.insert(key[BAGGAGE_PREFIX.len()..].to_owned(), value.to_owned());
                    }
                }
            }
        }
        if trace_id == 0 {
            return Err(Error::SpanContextNotFound);
        }
        Ok(SpanContext::new(trace_id, span_id, parent_id, flags, baggage))
    }
}

/// The [`BINARY`] codec.
///
/// Layout, all integers big-endian: trace id, span id, parent id, flags and
/// the baggage item count as u64, followed by each item as key length,
/// value length, key bytes, value bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

impl Injecter for BinaryCodec {
    fn inject(&self, context: &SpanContext, carrier: &mut InjectCarrier<'_>) -> Result<(), Error> {
        let writer = match carrier {
            InjectCarrier::Binary(writer) => writer,
            _ => return Err(Error::InvalidCarrier),
        };
        let baggage = context.baggage();
        let mut buf = Vec::with_capacity(8 * 5);
        buf.extend_from_slice(&context.trace_id().to_be_bytes());
        buf.extend_from_slice(&context.span_id().to_be_bytes());
        buf.extend_from_slice(&context.parent_id().to_be_bytes());
        buf.extend_from_slice(&context.flags().to_be_bytes());
        buf.extend_from_slice(&(baggage.len() as u64).to_be_bytes());
        for (key, value) in baggage {
            buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
            buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        writer.write_all(&buf)?;
        Ok(())
    }
}

/// Truncated payloads mean the carrier holds no (whole) span context, which
/// is reported as such rather than as an I/O failure.
fn read_exact(reader: &mut dyn Read, buf: &mut [u8]) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::SpanContextNotFound,
        _ => Error::Io(err),
    })
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(raw)
}

impl Extracter for BinaryCodec {
    fn extract(&self, carrier: &mut ExtractCarrier<'_>) -> Result<SpanContext, Error> {
        let reader: &mut dyn Read = match carrier {
            ExtractCarrier::Binary(reader) => &mut **reader,
            _ => return Err(Error::InvalidCarrier),
        };
        let mut header = [0u8; 8 * 5];
        read_exact(reader, &mut header)?;
        let trace_id = read_u64(&header);
        let span_id = read_u64(&header[8..]);
        let parent_id = read_u64(&header[16..]);
        let flags = read_u64(&header[24..]);
        let count = read_u64(&header[32..]);

        let mut baggage = HashMap::new();
        let mut lengths = [0u8; 8 * 2];
        for _ in 0..count {
            read_exact(reader, &mut lengths)?;
            let key_len = read_u64(&lengths) as usize;
            let value_len = read_u64(&lengths[8..]) as usize;
            if key_len == 0 {
                return Err(Error::SpanContextNotFound);
            }
            let mut item = vec![0u8; key_len + value_len];
            read_exact(reader, &mut item)?;
            baggage.insert(
                String::from_utf8_lossy(&item[..key_len]).into_owned(),
                String::from_utf8_lossy(&item[key_len..]).into_owned(),
            );
        }

        Ok(SpanContext::new(trace_id, span_id, parent_id, flags, baggage))
    }
}
