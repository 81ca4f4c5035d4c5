use super::*;

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

type Model = BTreeMap<Vec<u8>, BTreeSet<DocId>>;

fn validate_index(index: &RadixIndex, model: &Model) {
    let problems = index.verify_integrity();
    assert!(problems.is_empty(), "integrity problems: {:?}", problems);

    let stats = index.stats();
    assert_eq!(stats.final_words, model.len(), "final word count must match model");
    assert_eq!(
        stats.postings,
        model.values().map(BTreeSet::len).sum::<usize>(),
        "posting count must match model"
    );

    let got = index.words();
    let expected: Vec<(Vec<u8>, Vec<DocId>)> = model
        .iter()
        .map(|(word, ids)| (word.clone(), ids.iter().copied().collect()))
        .collect();
    assert_eq!(got, expected);
}

#[derive(Clone, Debug)]
enum Op {
    Insert(Vec<u8>, DocId),
    Find(Vec<u8>),
    RoundTrip,
}

fn word_strategy() -> impl Strategy<Value = Vec<u8>> + Clone {
    // Mostly a narrow alphabet so words share prefixes, sometimes any byte so
    // single nodes fill up to Node256.
    prop_oneof![
        3 => prop::collection::vec(b'a'..=b'f', 0..=6),
        1 => prop::collection::vec(any::<u8>(), 0..=3),
    ]
}

fn deep_word_strategy() -> impl Strategy<Value = Vec<u8>> {
    // Long words over two letters: deep chains that branch now and then.
    prop_oneof![
        4 => word_strategy(),
        1 => prop::collection::vec(b'a'..=b'b', 100..=3000),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let word = word_strategy();
    let op = prop_oneof![
        60 => (word.clone(), 0u64..64).prop_map(|(w, id)| Op::Insert(w, id)),
        38 => word.clone().prop_map(Op::Find),
        2 => Just(Op::RoundTrip),
    ];
    prop::collection::vec(op, 0..=1500)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 20_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in ops_strategy()) {
        let mut index = RadixIndex::new();
        let mut model: Model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(word, id) => {
                    let result = index.insert(&word, id);
                    if word.is_empty() {
                        prop_assert!(matches!(result, Err(IndexError::InvalidArgument(_))));
                    } else {
                        prop_assert!(result.is_ok());
                        model.entry(word).or_default().insert(id);
                    }
                }
                Op::Find(word) => {
                    let got = index.find(&word);
                    let expected = model.get(&word).map(|ids| ids.iter().copied().collect::<Vec<_>>());
                    prop_assert_eq!(got, expected);
                }
                Op::RoundTrip => {
                    let bytes = codec::export_to_vec(&index).unwrap();
                    index = codec::import_from_slice(&bytes).unwrap();
                    prop_assert_eq!(codec::export_to_vec(&index).unwrap(), bytes);
                }
            }
        }

        validate_index(&index, &model);
    }

    #[test]
    fn prop_codec_round_trip(words in prop::collection::vec((deep_word_strategy(), 0u64..1000), 0..=200)) {
        let index = RadixIndex::new();
        let mut model: Model = BTreeMap::new();
        for (word, id) in words {
            if word.is_empty() {
                continue;
            }
            index.insert(&word, id).unwrap();
            model.entry(word).or_default().insert(id);
        }

        let bytes = codec::export_to_vec(&index).unwrap();
        let restored = codec::import_from_slice(&bytes).unwrap();
        validate_index(&restored, &model);
        prop_assert_eq!(restored.stats(), index.stats());
    }

    #[test]
    fn prop_truncated_input_is_rejected(words in prop::collection::vec(word_strategy(), 1..=50), cut in any::<prop::sample::Index>()) {
        let index = RadixIndex::new();
        for (id, word) in words.iter().enumerate() {
            if !word.is_empty() {
                index.insert(word, id as DocId).unwrap();
            }
        }
        let bytes = codec::export_to_vec(&index).unwrap();
        let cut = cut.index(bytes.len());
        prop_assert!(codec::import_from_slice(&bytes[..cut]).is_err());
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_insert_order_small_set() {
    let words: Vec<Vec<u8>> = vec![
        b"a".to_vec(),
        b"b".to_vec(),
        b"c".to_vec(),
        b"aa".to_vec(),
        b"ab".to_vec(),
        b"ba".to_vec(),
    ];

    for_each_permutation(&words, |perm| {
        let index = RadixIndex::new();
        let mut model: Model = BTreeMap::new();

        for (i, word) in perm.into_iter().enumerate() {
            let id = (i % 3) as DocId;
            index.insert(&word, id).unwrap();
            model.entry(word).or_default().insert(id);
        }

        validate_index(&index, &model);
        let restored = codec::import_from_slice(&codec::export_to_vec(&index).unwrap()).unwrap();
        validate_index(&restored, &model);
    });
}

#[test]
fn exhaustive_upgrade_boundaries() {
    // One past each capacity, and a full Node256.
    for fanout in [4usize, 5, 16, 17, 48, 49, 256] {
        let index = RadixIndex::new();
        let mut model: Model = BTreeMap::new();
        for byte in 0..fanout {
            let word = vec![b'x', byte as u8];
            index.insert(&word, byte as DocId).unwrap();
            model.entry(word).or_default().insert(byte as DocId);
        }
        validate_index(&index, &model);

        let restored = codec::import_from_slice(&codec::export_to_vec(&index).unwrap()).unwrap();
        validate_index(&restored, &model);
        let expected_type = match fanout {
            0..=4 => art::NodeType::Node4,
            5..=16 => art::NodeType::Node16,
            17..=48 => art::NodeType::Node48,
            _ => art::NodeType::Node256,
        };
        let node = restored.find_node(b"x").unwrap();
        assert_eq!(node.read().node_type(), expected_type);
    }
}
