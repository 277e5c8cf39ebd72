//! Role/ownership permission matrix for trip-scoped resources.
//!
//! Lookups are pure; the request-facing gate lives in
//! [`crate::middleware::rbac`].

use error_types::{error_codes, AppError};
use std::fmt;

use crate::models::MemberRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Trip,
    Member,
    Invitation,
    Chat,
    Todo,
    Expense,
    Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Remove,
    ChangeRole,
    Leave,
    Invite,
}

/// How resource ownership interacts with the minimum role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Role alone decides.
    None,
    /// Caller needs the minimum role and must own the resource.
    OwnerOnly,
    /// Either the minimum role or ownership admits the caller.
    OwnerOrRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub min_role: MemberRole,
    pub ownership: Ownership,
}

impl Rule {
    const fn role(min_role: MemberRole) -> Self {
        Self {
            min_role,
            ownership: Ownership::None,
        }
    }

    const fn with(min_role: MemberRole, ownership: Ownership) -> Self {
        Self {
            min_role,
            ownership,
        }
    }

    pub fn requires_ownership(&self) -> bool {
        self.ownership != Ownership::None
    }

    pub fn admits(&self, role: MemberRole, is_owner: bool) -> bool {
        match self.ownership {
            Ownership::None => role.at_least(self.min_role),
            Ownership::OwnerOnly => role.at_least(self.min_role) && is_owner,
            Ownership::OwnerOrRole => role.at_least(self.min_role) || is_owner,
        }
    }
}

/// Matrix lookup. `None` means the pair is not defined and is denied.
pub fn rule_for(resource: Resource, action: Action) -> Option<Rule> {
    use Action::*;
    use MemberRole::{Admin, Member, Owner};
    use Ownership::{OwnerOnly, OwnerOrRole};

    let rule = match (resource, action) {
        (Resource::Trip, Create | Read) => Rule::role(Member),
        (Resource::Trip, Update) => Rule::role(Admin),
        (Resource::Trip, Delete) => Rule::role(Owner),

        (Resource::Member, Read | Leave) => Rule::role(Member),
        (Resource::Member, Create | Remove) => Rule::role(Owner),
        (Resource::Member, ChangeRole) => Rule::role(Admin),

        (Resource::Invitation, Create | Read | Delete) => Rule::role(Admin),

        (Resource::Chat, Create | Read) => Rule::role(Member),
        (Resource::Chat, Update) => Rule::with(Member, OwnerOnly),
        (Resource::Chat, Delete) => Rule::with(Admin, OwnerOrRole),

        (Resource::Todo | Resource::Expense, Create | Read) => Rule::role(Member),
        (Resource::Todo | Resource::Expense, Update | Delete) => Rule::with(Admin, OwnerOrRole),

        (Resource::Location, Create | Read) => Rule::role(Member),
        (Resource::Location, Update | Delete) => Rule::with(Member, OwnerOnly),

        _ => return None,
    };
    Some(rule)
}

pub fn is_permitted(role: MemberRole, resource: Resource, action: Action, is_owner: bool) -> bool {
    rule_for(resource, action)
        .map(|rule| rule.admits(role, is_owner))
        .unwrap_or(false)
}

/// Owner is assigned at trip creation only; no runtime transition may
/// enter or leave it.
pub fn validate_role_transition(current: MemberRole, requested: MemberRole) -> Result<(), AppError> {
    if current == MemberRole::Owner || requested == MemberRole::Owner {
        return Err(AppError::forbidden(
            error_codes::OWNER_IMMUTABLE,
            "The owner role cannot be assigned or removed",
        ));
    }
    Ok(())
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Trip => "trip",
            Resource::Member => "member",
            Resource::Invitation => "invitation",
            Resource::Chat => "chat",
            Resource::Todo => "todo",
            Resource::Expense => "expense",
            Resource::Location => "location",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Remove => "remove",
            Action::ChangeRole => "change_role",
            Action::Leave => "leave",
            Action::Invite => "invite",
        };
        f.write_str(name)
    }
}
