// fw-test-utils: scripted raw-TCP peers speaking the wire envelope.
//
// Integration suites mostly exercise the real Server and Client against
// each other; these mocks cover the protocol-level lanes — scripting one
// side of a conversation by hand, or injecting deliberately broken bytes.

pub mod mock_peer;

pub use mock_peer::{MockPeerClient, MockPeerConnection, MockPeerServer};
