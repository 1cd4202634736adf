//! Type-safe tool argument contracts.
//!
//! State-changing tool invocations (`snap install`, `juju deploy`, `parted`,
//! `mkfs`, ...) are described by small structs implementing `ToolArgs`
//! instead of ad-hoc string vectors. The struct is the contract: a flag
//! spelled wrong (`--chanel`) is a compile error in one place, not a runtime
//! failure halfway through provisioning.
//!
//! Read-only queries are built directly as `CommandSpec`s.

use crate::command::CommandSpec;

/// Typed arguments for one mutating tool invocation.
///
/// # Contract
///
/// - `program()`: binary name, resolved through `PATH`
/// - `to_cli_args()`: arguments exactly as the tool expects them
/// - `get_env_vars()`: environment the tool needs, if any
/// - `requires_root()`: whether the call goes through `sudo`
pub trait ToolArgs {
    fn program(&self) -> &'static str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn requires_root(&self) -> bool {
        false
    }

    /// Command for this invocation, marked mutating so dry runs skip it.
    fn to_command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(self.program())
            .args(self.to_cli_args())
            .mutating();
        for (key, value) in self.get_env_vars() {
            spec = spec.env(key, value);
        }
        if self.requires_root() {
            spec = spec.privileged();
        }
        spec
    }
}
