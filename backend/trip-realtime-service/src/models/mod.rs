pub mod invitation;
pub mod member;
pub mod trip;

pub use invitation::{Invitation, InvitationRequest, InvitationStatus, UserSummary};
pub use member::{MemberRole, TripMember};
pub use trip::{NewTrip, Trip, TripStatus, TripUpdate};
