pub mod cadnum;
pub mod config;
pub mod projection;
pub mod query;
pub mod record;
pub mod selection;

pub use cadnum::normalize_cad_number;
pub use config::{EnrichMode, PortalConfig};
pub use projection::{
    DEFAULT_FILTER_EXPRESSION, DEFAULT_SORT_EXPRESSION, FilterDirection, RecordFilter,
    RecordSorter, SortDirection,
};
pub use query::{AddressFields, CadastralBatches, FormParams, QueryError, SearchKind};
pub use record::{Entry, ResultRecord, UNKNOWN_STATUS};
pub use selection::SelectionState;
