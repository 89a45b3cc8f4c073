/// Wrapper for configuring the bridge itself.
pub mod bridge_config;
/// Wrapper for configuring the VMs of a plan.
pub mod machine_config;
