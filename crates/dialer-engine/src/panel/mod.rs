//! Dialer-management panel client: batch pull, result reporting, scenario
//! registration. Ported from `integrations/panel/client.py::PanelClient`.

pub mod client;

pub use client::{
    NextBatchResponse, PanelAgent, PanelClient, PanelNumber, PanelOutboundLine,
};
