use num_bigint::BigUint;

use ipecc_rs::emu::{parse_initial_state, run, ArithFlags, EmuOptions, ExecutionContext};
use ipecc_rs::{assemble, IsaSpec};

fn emulate(src: &str, init: &str) -> (IsaSpec, ExecutionContext) {
    let spec = IsaSpec::default();
    let prog = assemble(&spec, src).unwrap();
    let state = parse_initial_state(&spec, init).unwrap();
    let mut ctx = ExecutionContext::new(&spec, &state);
    run(&spec, &prog.listing, &mut ctx, &EmuOptions::default()).unwrap();
    (spec, ctx)
}

fn reg<'a>(spec: &IsaSpec, ctx: &'a ExecutionContext, name: &str) -> &'a BigUint {
    &ctx.regs[spec.operands[name] as usize]
}

#[test]
fn mask_generators_expose_the_mask_register() {
    let (_, ctx) = emulate("NNRNDS 1, dtmp\nSTOP\n", "");
    let spec = IsaSpec::default();
    assert_eq!(reg(&spec, &ctx, "dtmp"), &ctx.masks[1]);
}

// Masked shift must agree with the plain shift once unmasked: mask a
// value, shift it masked, then remove the shifted mask and compare
// against NNSRL of the original. The mask is random, the relation is
// not.
#[test]
fn masked_shift_equals_plain_shift_after_unmasking() {
    let src = "\
	NNRNDS 0, mu0
	NNXOR a, mu0, phi0
	NNSRLS phi0, 0, phi0
	NNSRL mu0, mu1
	NNXOR phi0, mu1, phi0
	NNSRL a, dtmp
	STOP
";
    let (spec, ctx) = emulate(src, "a=0x1234567deadbeef\n");
    assert_eq!(reg(&spec, &ctx, "phi0"), reg(&spec, &ctx, "dtmp"));
}

#[test]
fn masked_shift_carry_tracks_the_unmasked_lsb() {
    // a odd: the shift carry must be set regardless of the mask's own
    // lsb.
    let src = "\
	NNRNDS 0, mu0
	NNXOR a, mu0, phi0
	NNSRLS phi0, 0, phi0
	STOP
";
    let (_, odd) = emulate(src, "a=3\n");
    assert!(odd.arith.contains(ArithFlags::CSHIFT));
}

#[test]
fn nnsrls_shifts_the_stored_mask_in_lockstep() {
    let src = "\
	NNRNDS 2, mu0
	NNSRLS zero, 2, phi0
	STOP
";
    let (_, ctx) = emulate(src, "");
    // The context mask for slot 2 was shifted right once by NNSRLS.
    let spec = IsaSpec::default();
    let original = reg(&spec, &ctx, "mu0");
    assert_eq!(&ctx.masks[2], &(original >> 1u32));
}
