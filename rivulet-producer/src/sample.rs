use rand::seq::SliceRandom;
use rand::Rng;

use rivulet_core::record::Review;

const PHRASES: [&str; 5] = [
    "Great food and excellent service! Would definitely come back.",
    "Terrible experience. Food was cold and service was slow.",
    "Average place. Nothing special but not bad either.",
    "Amazing atmosphere and delicious meals. Highly recommend!",
    "Disappointed with the quality. Used to be much better.",
];

/// Date written into generated reviews.
const SAMPLE_DATE: &str = "2025-07-06";

/// Generate `n` synthetic reviews, for trying the pipeline without a bulk source.
pub fn generate_reviews<R: Rng>(rng: &mut R, n: usize) -> Vec<Review> {
    (0..n)
        .map(|i| {
            let phrase = PHRASES.choose(rng).copied().unwrap_or(PHRASES[0]);

            Review {
                review_id: format!("test_{}", i),
                text: format!("This is test review {}. {}", i, phrase),
                stars: rng.gen_range(1..=5u32) as f64,
                date: SAMPLE_DATE.to_string(),
                business_id: format!("biz_{}", rng.gen_range(1..=10)),
                user_id: format!("user_{}", rng.gen_range(1..=100)),
                ..Review::default()
            }
        })
        .collect()
}
