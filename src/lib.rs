//! An SCXML (Harel Statecharts) interpreter.\
//! \
//! Parses State Chart XML according to the W3C recommendation and executes
//! it with the algorithm described there.\
//! See <https://www.w3.org/TR/scxml/>

pub mod common;
pub mod datamodel;
pub mod event_io_processor;
pub mod executable_content;
pub mod expression_datamodel;
pub mod fsm;
pub mod fsm_executor;
pub mod scheduler;
pub mod scxml_event_io_processor;
pub mod scxml_reader;
pub mod test;
pub mod tracer;
