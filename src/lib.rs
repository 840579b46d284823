// Control-plane packet injection harness: send a fixed burst of template
// packets into the dataplane, record what comes back, dump both on interrupt.
pub mod dump;
pub mod harness;
pub mod history;
pub mod packet;
pub mod platform;
pub mod receiver;
pub mod scheduler;
