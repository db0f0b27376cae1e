#![no_std]
#![no_main]

mod maps;

use aya_ebpf::{
    bindings::xdp_action, helpers::bpf_ktime_get_ns, macros::xdp, programs::XdpContext,
};
use aya_log_ebpf::debug;
use ssdp_filter_common::{PacketView, Verdict, decide};

use crate::maps::{KernelBlocklist, KernelFeatures, KernelStats, filter_config};

#[xdp]
pub fn xdp_ssdp_filter(ctx: XdpContext) -> u32 {
    // SAFETY: [data, data_end) is the packet the kernel handed us and stays
    // valid for the whole invocation.
    let view = unsafe { PacketView::from_raw(ctx.data(), ctx.data_end()) };
    let now = unsafe { bpf_ktime_get_ns() };
    let config = filter_config();

    let decision = decide(
        view,
        &config,
        now,
        &KernelBlocklist,
        &KernelStats,
        &KernelFeatures,
    );

    match decision.verdict {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => {
            debug!(&ctx, "drop ssdp from {:i}", decision.src_addr);
            xdp_action::XDP_DROP
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
