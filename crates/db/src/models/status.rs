//! Status helper enums mapping to SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data in the
//! corresponding `*_statuses` database table.

use trainyard_core::lifecycle::JobState;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up the variant for a database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( v if v == $val => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }
    };
}

define_status_enum! {
    /// Job lifecycle status.
    JobStatus {
        Reserved = 1,
        Running = 2,
        Stopping = 3,
        Finished = 4,
        Deleted = 5,
    }
}

impl From<JobState> for JobStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Reserved => JobStatus::Reserved,
            JobState::Running => JobStatus::Running,
            JobState::Stopping => JobStatus::Stopping,
            JobState::Finished => JobStatus::Finished,
            JobState::Deleted => JobStatus::Deleted,
        }
    }
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Reserved => JobState::Reserved,
            JobStatus::Running => JobState::Running,
            JobStatus::Stopping => JobState::Stopping,
            JobStatus::Finished => JobState::Finished,
            JobStatus::Deleted => JobState::Deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_match_seed_data() {
        assert_eq!(JobStatus::Reserved.id(), 1);
        assert_eq!(JobStatus::Finished.id(), 4);
        assert_eq!(StatusId::from(JobStatus::Deleted), 5);
    }

    #[test]
    fn every_state_round_trips_through_its_id() {
        for state in [
            JobState::Reserved,
            JobState::Running,
            JobState::Stopping,
            JobState::Finished,
            JobState::Deleted,
        ] {
            let id = JobStatus::from(state).id();
            let back = JobStatus::from_id(id).map(JobState::from);
            assert_eq!(back, Some(state));
        }
    }

    #[test]
    fn unknown_id_is_none() {
        assert_eq!(JobStatus::from_id(0), None);
        assert_eq!(JobStatus::from_id(6), None);
    }
}
