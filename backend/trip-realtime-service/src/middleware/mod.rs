pub mod rbac;

pub use rbac::{
    owner_from_path, IsResourceOwner, OwnerIdExtractor, RequirePermission, ResourceOwnerId,
    UserRole,
};
