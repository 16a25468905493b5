pub mod mock_webhook;
pub mod test_profiles;
pub mod test_stack;

// Re-export commonly used items
pub use mock_webhook::MockWebhookServer;
pub use test_profiles::*;
pub use test_stack::{StackOptions, TestStack};
