use uuid::Uuid;

/// The chair on whose behalf a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChairPrincipal {
    pub chair_id: Uuid,
    pub owner_id: Uuid,
}

/// The rider on whose behalf a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiderPrincipal {
    pub user_id: Uuid,
}

/// The chair owner on whose behalf a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerPrincipal {
    pub owner_id: Uuid,
}
