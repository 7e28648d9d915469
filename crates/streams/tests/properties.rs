use proptest::prelude::*;
use rig_types::{Sample, Value};
use streams::{DrainMode, StreamBuffer, StreamSchema};

#[derive(Debug, Clone)]
enum Op {
    Append(usize),
    Drain(Option<usize>),
    Peek(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..20).prop_map(Op::Append),
        prop::option::of(0usize..15).prop_map(Op::Drain),
        (0usize..10).prop_map(Op::Peek),
    ]
}

fn id(s: &Sample) -> i64 {
    match s.data {
        Value::Int(i) => i,
        _ => unreachable!(),
    }
}

proptest! {
    #[test]
    fn drained_samples_are_an_ordered_prefix(window in 0usize..6, ops in prop::collection::vec(op(), 1..40)) {
        let buf = StreamBuffer::new();
        buf.declare_stream("dev", "s", StreamSchema::new("int64", vec![1], 10.0).solidify_after(window)).unwrap();

        let mut appended = 0i64;
        let mut drained = Vec::new();

        for op in ops {
            match op {
                Op::Append(n) => {
                    for _ in 0..n {
                        buf.append("dev", "s", Sample::new(appended as f64, Value::Int(appended))).unwrap();
                        appended += 1;
                    }
                }
                Op::Drain(max) => {
                    let mode = max.map_or(DrainMode::Available, DrainMode::Max);
                    let before = buf.len("dev", "s").unwrap();
                    let got: Vec<i64> = buf.drain("dev", "s", mode).unwrap().map(|s| id(&s)).collect();
                    prop_assert!(before - got.len() >= window.min(before));
                    drained.extend(got);
                }
                Op::Peek(n) => {
                    let peeked: Vec<i64> = buf.peek_newest("dev", "s", n).unwrap().iter().map(id).collect();
                    prop_assert!(peeked.len() <= n.min(window));
                    prop_assert!(peeked.windows(2).all(|w| w[0] > w[1]));
                    prop_assert!(peeked.iter().all(|p| !drained.contains(p)));
                }
            }
            let remaining = buf.len("dev", "s").unwrap() as i64;
            prop_assert_eq!(drained.len() as i64 + remaining, appended);
        }

        // Prefix: exactly the first drained.len() appended ids, in order.
        let expected: Vec<i64> = (0..drained.len() as i64).collect();
        prop_assert_eq!(&drained, &expected);

        let rest: Vec<i64> = buf.drain("dev", "s", DrainMode::Flush).unwrap().map(|s| id(&s)).collect();
        prop_assert_eq!(drained.len() + rest.len(), appended as usize);
        prop_assert!(buf.is_empty());
    }
}
