//! Portal client: session bootstrap, reference loading, and the concurrent
//! fetch-parse-enrich pipeline.

mod client;
mod enrich;
mod error;
mod events;
mod page;
mod pipeline;
mod references;
mod results;
mod session;
mod transport;

#[cfg(test)]
mod testing;

pub use client::PortalClient;
pub use enrich::{
    API_ACTUAL_KEY, ENCUMBRANCE_KEY, Enricher, PortalEnricher, RIGHT_KEY, apply_api_object,
    apply_detail_page,
};
pub use error::PortalError;
pub use events::{EventSink, PortalEvent};
pub use page::{ParsedPage, ResultsPage, parse_results_page, parse_rows};
pub use pipeline::{SearchOutcome, SearchSummary};
pub use references::{
    ReferenceLists, ReferenceLoader, STREET_TYPES_ROOT, parse_listing, regions_root,
    settlement_types_root, settlements_root, typed_settlements_root,
};
pub use results::ResultSet;
pub use session::{SessionInfo, SessionManager, SessionState};
pub use transport::{Method, PortalRequest, PortalResponse, ReqwestTransport, Transport};
