//! Property tests over generated layouts

mod common;

use common::*;
use devmodel_driver::{MemPlacement, SimDevice};
use devmodel_runtime::{
    ActiveBaseAddressMap, AllocationKind, CompiledProgram, MemAllocationTable, ModelOptions, PlacedBuffer,
    RefreshContext, RefreshEngine, RefreshPolicy, RegionDesc, TaskArg, TensorDesc, ZeroCopyClassifier,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const INPUT_BASE: u64 = 0x100_0000;
const OUTPUT_BASE: u64 = 0x200_0000;
const STRIDE: u64 = 0x1000;

#[derive(Debug, Clone)]
struct LayoutShape {
    feature_maps: usize,
    inputs: Vec<(u64, bool)>,
    /// `(size, consumed, shares the previous output's address)`
    outputs: Vec<(u64, bool, bool)>,
}

fn layout_shape() -> impl Strategy<Value = LayoutShape> {
    (
        0usize..3,
        prop::collection::vec((1u64..256, any::<bool>()), 0..5),
        prop::collection::vec((1u64..256, any::<bool>(), any::<bool>()), 0..5),
    )
        .prop_map(|(feature_maps, inputs, outputs)| LayoutShape {
            feature_maps,
            inputs,
            outputs,
        })
}

fn build_program(shape: &LayoutShape) -> CompiledProgram {
    let inputs: Vec<_> = shape
        .inputs
        .iter()
        .enumerate()
        .map(|(i, (size, _))| tensor(INPUT_BASE + i as u64 * STRIDE, *size))
        .collect();

    let mut outputs: Vec<TensorDesc> = Vec::new();
    for (i, (size, _, shared)) in shape.outputs.iter().enumerate() {
        // Outputs sharing an address share a size so they never partially overlap.
        let desc = match outputs.last() {
            Some(previous) if *shared => *previous,
            _ => tensor(OUTPUT_BASE + i as u64 * STRIDE, *size),
        };
        outputs.push(desc);
    }

    let mut args = Vec::new();
    for (tensor, (_, consumed)) in inputs.iter().zip(&shape.inputs) {
        if *consumed {
            args.push(TaskArg::Addr(tensor.logical_addr));
        }
    }
    for (tensor, (_, consumed, _)) in outputs.iter().zip(&shape.outputs) {
        if *consumed {
            args.push(TaskArg::Addr(tensor.logical_addr));
        }
    }
    args.push(TaskArg::Value(0));

    let mut program = program("generated", inputs, outputs, vec![kernel(0, "spin", args)]);
    program.layout.feature_maps = (0..shape.feature_maps)
        .map(|i| RegionDesc {
            logical_addr: FM_BASE + i as u64 * STRIDE,
            size: 0x100,
        })
        .collect();
    program
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocation_ids_are_dense_with_one_trailing_sentinel(shape in layout_shape()) {
        let program = build_program(&shape);
        let options = ModelOptions::default();
        let classification = ZeroCopyClassifier::new(&program, &options).classify_all();
        let plan = MemAllocationTable::build(&program, &classification.registry, &options).unwrap();

        let ids: Vec<u32> = plan.table.iter().map(|a| a.id.0).collect();
        let expected: Vec<u32> = (0..plan.table.len() as u32).collect();
        prop_assert_eq!(ids, expected);

        let absolute: Vec<_> = plan.table.iter().filter(|a| a.kind == AllocationKind::Absolute).collect();
        prop_assert_eq!(absolute.len(), 1);
        prop_assert_eq!(absolute[0].id.0 as usize, plan.table.len() - 1);
        prop_assert_eq!(plan.table.absolute_id(), Some(absolute[0].id));
    }

    #[test]
    fn classification_is_deterministic(shape in layout_shape()) {
        let program = build_program(&shape);
        let options = ModelOptions::default();
        let first = ZeroCopyClassifier::new(&program, &options).classify_all();
        let copy = program.clone();
        let second = ZeroCopyClassifier::new(&copy, &options).classify_all();
        prop_assert_eq!(&first, &second);

        // Every copy-only address stays accounted for after the build.
        let plan = MemAllocationTable::build(&program, &first.registry, &options).unwrap();
        prop_assert!(devmodel_runtime::audit_copy_only(&first.registry, &plan.table, &plan.copy_infos).is_ok());
    }

    #[test]
    fn refresh_never_under_reports_and_settles(
        shape in layout_shape(),
        moves in prop::collection::vec(prop::collection::vec(any::<bool>(), 5), 1..4),
    ) {
        let program = build_program(&shape);
        let options = ModelOptions::default();
        let classification = ZeroCopyClassifier::new(&program, &options).classify_all();
        let plan = MemAllocationTable::build(&program, &classification.registry, &options).unwrap();
        let device = SimDevice::new();
        let mut bases = ActiveBaseAddressMap::new(&plan.table);
        let mut engine = RefreshEngine::new("generated", BTreeSet::new(), false);
        let host_staging = BTreeMap::new();
        let owned: Vec<_> = plan
            .table
            .iter()
            .filter(|a| a.kind == AllocationKind::FeatureMap)
            .map(|a| (a.id, 0x7000_0000 + a.logical_addr))
            .collect();

        let buffers = |generation: &[u64], count: usize, base: u64| -> Vec<PlacedBuffer> {
            (0..count)
                .map(|i| PlacedBuffer {
                    addr: base + i as u64 * STRIDE + generation[i] * 0x10_0000,
                    size: 0,
                    placement: MemPlacement::Device,
                })
                .collect()
        };
        let mut in_gen = vec![0u64; 5];
        let mut out_gen = vec![0u64; 5];

        for (round, step) in moves.iter().enumerate() {
            for (i, moved) in step.iter().enumerate() {
                if *moved && round > 0 {
                    in_gen[i] += 1;
                    out_gen[i] += 1;
                }
            }
            let inputs = buffers(&in_gen, shape.inputs.len(), 0x4000_0000);
            let outputs = buffers(&out_gen, shape.outputs.len(), 0x5000_0000);
            let report = engine
                .refresh(RefreshContext {
                    driver: &device,
                    table: &plan.table,
                    bases: &mut bases,
                    input_bindings: &plan.inputs,
                    output_bindings: &plan.outputs,
                    inputs: &inputs,
                    outputs: &outputs,
                    owned_bases: &owned,
                    host_staging: &host_staging,
                })
                .unwrap();
            for (_, policy) in &report.contributions {
                prop_assert!(report.policy >= *policy);
            }
            if round == 0 {
                prop_assert_eq!(report.policy, RefreshPolicy::UpdateAllOneTime);
            }
            engine.commit(&mut bases);

            let again = engine
                .refresh(RefreshContext {
                    driver: &device,
                    table: &plan.table,
                    bases: &mut bases,
                    input_bindings: &plan.inputs,
                    output_bindings: &plan.outputs,
                    inputs: &inputs,
                    outputs: &outputs,
                    owned_bases: &owned,
                    host_staging: &host_staging,
                })
                .unwrap();
            prop_assert_eq!(again.policy, RefreshPolicy::NoUpdate);
            prop_assert!(again.contributions.is_empty());
        }
    }
}
