// tvrelay-livestream - shared live-stream engine
//
// One upstream process per stream key, shared by every viewer:
// - registry/    - create-or-attach map, stream ownership, teardown
// - supervisor/  - subprocess lifecycle and output capture
// - buffer/      - chunk log (TS) and channel directories (HLS)
// - session      - attached viewers per stream
// - failover     - ordered source chain per stream
// - delivery/    - TS pull loop and HLS file serving
// - reaper       - periodic idle sweep
// - api          - bundle consumed by the HTTP layer

pub mod api;
pub mod buffer;
pub mod delivery;
pub mod error;
pub mod failover;
pub mod key;
pub mod model;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use api::StreamingInfrastructure;
pub use delivery::{HlsDelivery, HlsManifest, TsDelivery, TsStream};
pub use error::{StreamError, StreamResult};
pub use failover::{FailoverPhase, FailoverResolver, FailoverState};
pub use key::StreamKey;
pub use model::{ClientInfo, ClientSession, HealthStatus, SharedStream, StreamStatus, StreamSummary};
pub use reaper::{IdleReaper, ReapReport};
pub use registry::{Attachment, StreamRegistry};
pub use session::{SessionStats, SessionTracker};
