use fake::faker::name::en::{FirstName, LastName};
use fake::Fake;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::models::{FakeName, Sex};

const MALE_FIRST_NAMES: &[&str] = &[
    "James", "John", "Robert", "Michael", "William", "David", "Richard", "Joseph", "Thomas",
    "Charles", "Daniel", "Matthew", "Anthony", "Mark", "Paul", "Steven", "Andrew", "Joshua",
    "Kevin", "Brian", "George", "Edward", "Ronald", "Timothy", "Jason", "Jeffrey", "Ryan",
];

const FEMALE_FIRST_NAMES: &[&str] = &[
    "Mary", "Patricia", "Jennifer", "Linda", "Elizabeth", "Barbara", "Susan", "Jessica",
    "Sarah", "Karen", "Nancy", "Lisa", "Betty", "Margaret", "Sandra", "Ashley", "Emily",
    "Donna", "Michelle", "Carol", "Amanda", "Melissa", "Deborah", "Stephanie", "Rebecca",
];

/// Source of plausible replacement names.
///
/// Names do not have to be unique; only pseudo-identifiers are.
pub trait NameGenerator: Send + Sync {
    fn name_for(&mut self, sex: Sex) -> FakeName;
}

/// Name generator backed by the `fake` crate with an explicit RNG.
pub struct FakerNames {
    rng: StdRng,
}

impl FakerNames {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn pick(&mut self, names: &[&str]) -> String {
        names
            .choose(&mut self.rng)
            .map(|s| s.to_string())
            .unwrap_or_default()
    }
}

impl NameGenerator for FakerNames {
    fn name_for(&mut self, sex: Sex) -> FakeName {
        let last_name: String = LastName().fake_with_rng(&mut self.rng);
        let first_name = match sex {
            Sex::Male => self.pick(MALE_FIRST_NAMES),
            Sex::Female => self.pick(FEMALE_FIRST_NAMES),
            Sex::Unspecified => FirstName().fake_with_rng(&mut self.rng),
        };
        FakeName {
            last_name: sanitize_component(&last_name),
            first_name: sanitize_component(&first_name),
        }
    }
}

// '^' and '=' are structural in DICOM person names.
fn sanitize_component(value: &str) -> String {
    value.replace(&['^', '='][..], " ").trim().to_string()
}
