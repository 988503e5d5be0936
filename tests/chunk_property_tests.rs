//! Property tests over the chunk codec and series iteration: append/read
//! round trips, iterator monotonicity, and transcode preservation for
//! arbitrary non-decreasing sample runs.

use proptest::prelude::*;
use varve::chunk::{Chunk, ChunkBufferPool, ChunkVariant};
use varve::{Interval, SamplePair};

const CHUNK_SIZE: usize = 1024;

/// Arbitrary sorted sample runs: timestamp deltas span the width classes,
/// values mix integers, fractions and special floats.
fn samples_strategy() -> impl Strategy<Value = Vec<SamplePair>> {
    let delta = prop_oneof![
        Just(0i64),
        1i64..256,
        256i64..65_536,
        65_536i64..5_000_000,
    ];
    let value = prop_oneof![
        (-1000i64..1000).prop_map(|v| v as f64),
        (-1e9f64..1e9),
        Just(0.0f64),
        Just(f64::MAX / 2.0),
        Just(f64::NAN),
    ];
    proptest::collection::vec((delta, value), 1..600).prop_map(|pairs| {
        let mut t = 0i64;
        pairs
            .into_iter()
            .map(|(d, v)| {
                t += d;
                SamplePair {
                    timestamp: t,
                    value: v,
                }
            })
            .collect()
    })
}

fn add_all(pool: &ChunkBufferPool, samples: &[SamplePair]) -> Vec<Chunk> {
    let mut chunks = vec![Chunk::new(ChunkVariant::DeltaEncoded, CHUNK_SIZE, pool)];
    for &s in samples {
        let head = chunks.pop().unwrap();
        chunks.extend(head.add(s, pool).unwrap());
    }
    chunks
}

fn decode_chunks(chunks: &[Chunk]) -> Vec<SamplePair> {
    chunks.iter().flat_map(|c| c.decode_all()).collect()
}

fn same_sample(a: &SamplePair, b: &SamplePair) -> bool {
    a.timestamp == b.timestamp && (a.value == b.value || (a.value.is_nan() && b.value.is_nan()))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    /// Whatever widths, transcodes and overflows happen on the way in, the
    /// decoded sequence is exactly the appended sequence.
    #[test]
    fn append_then_decode_round_trips(samples in samples_strategy()) {
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let chunks = add_all(&pool, &samples);
        let decoded = decode_chunks(&chunks);
        prop_assert_eq!(decoded.len(), samples.len());
        for (d, s) in decoded.iter().zip(samples.iter()) {
            prop_assert!(same_sample(d, s), "decoded {:?} != appended {:?}", d, s);
        }
    }

    /// Marshaling each produced chunk and reading it back yields the same
    /// samples, and the written record has the fixed size.
    #[test]
    fn marshal_unmarshal_round_trips(samples in samples_strategy()) {
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        for chunk in add_all(&pool, &samples) {
            let record = chunk.to_record();
            prop_assert_eq!(record.len(), CHUNK_SIZE);
            let reread = Chunk::unmarshal(&record, &pool).unwrap();
            let original = chunk.decode_all();
            let decoded = reread.decode_all();
            prop_assert_eq!(decoded.len(), original.len());
            for (d, s) in decoded.iter().zip(original.iter()) {
                prop_assert!(same_sample(d, s));
            }
        }
    }

    /// Chunk boundaries are chronological, and cursor range reads across a
    /// chunk agree with direct decoding.
    #[test]
    fn chunks_are_ordered_and_ranges_consistent(samples in samples_strategy()) {
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let chunks = add_all(&pool, &samples);

        for pair in chunks.windows(2) {
            prop_assert!(pair[0].last_time() <= pair[1].first_time());
        }
        for chunk in &chunks {
            let full = chunk.cursor().range_values(Interval {
                oldest_inclusive: chunk.first_time(),
                newest_inclusive: chunk.last_time(),
            });
            prop_assert_eq!(full.len(), chunk.len());
            prop_assert!(full.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}
