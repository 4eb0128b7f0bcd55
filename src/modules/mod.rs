//! Built-in isolation modules.
//!
//! Forward ordering inside the child is namespaces -> rootfs -> mounts ->
//! seccomp -> caps, enforced through declared dependencies.

pub mod caps;
pub mod cgroups;
pub mod mounts;
pub mod namespaces;
pub mod rootfs;
pub mod seccomp;

pub use self::caps::CapsModule;
pub use self::cgroups::CgroupsModule;
pub use self::mounts::MountsModule;
pub use self::namespaces::NamespacesModule;
pub use self::rootfs::RootFsModule;
pub use self::seccomp::SeccompModule;
