// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The built-in script and register tables.
//!
//! Register addresses are the ARM CoreSight debug blocks (common to every
//! Cortex-M) plus the per-family peripheral registers the scripts touch.

use crate::{Reg, ScriptDef};

pub(crate) const REGISTERS: &[Reg] = &[
    // CoreSight, common to all Cortex-M parts.
    Reg { name: "SCB_VTOR", addr: 0xE000_ED08, width: 4 },
    Reg { name: "SCB_DEMCR", addr: 0xE000_EDFC, width: 4 },
    Reg { name: "TPIU_SSPSR", addr: 0xE004_0000, width: 4 },
    Reg { name: "TPIU_CSPSR", addr: 0xE004_0004, width: 4 },
    Reg { name: "TPIU_ACPR", addr: 0xE004_0010, width: 4 },
    Reg { name: "TPIU_SPPR", addr: 0xE004_00F0, width: 4 },
    Reg { name: "TPIU_FFCR", addr: 0xE004_0304, width: 4 },
    Reg { name: "TPIU_DEVID", addr: 0xE004_0FC8, width: 4 },
    Reg { name: "DWT_CTRL", addr: 0xE000_1000, width: 4 },
    Reg { name: "ITM_TER", addr: 0xE000_0E00, width: 4 },
    Reg { name: "ITM_TPR", addr: 0xE000_0E40, width: 4 },
    Reg { name: "ITM_TCR", addr: 0xE000_0E80, width: 4 },
    Reg { name: "ITM_LAR", addr: 0xE000_0FB0, width: 4 },
    // STM32F1 series.
    Reg { name: "RCC_APB2ENR", addr: 0x4002_1018, width: 4 },
    Reg { name: "AFIO_MAPR", addr: 0x4001_0004, width: 4 },
    // STM32F2/F4/F7 series.
    Reg { name: "RCC_AHB1ENR", addr: 0x4002_3830, width: 4 },
    Reg { name: "GPIOB_MODER", addr: 0x4002_0400, width: 4 },
    Reg { name: "GPIOB_OSPEEDR", addr: 0x4002_0408, width: 4 },
    Reg { name: "GPIOB_AFRL", addr: 0x4002_0420, width: 4 },
    Reg { name: "SYSCFG_MEMRMP", addr: 0x4001_3800, width: 4 },
    Reg { name: "DBGMCU_CR", addr: 0xE004_2004, width: 4 },
    // NXP LPC SYSCON.
    Reg { name: "SYSMEMREMAP", addr: 0x4004_8000, width: 4 },
    Reg { name: "TRACECLKDIV", addr: 0x4004_80AC, width: 4 },
    Reg { name: "MEMMAP", addr: 0x400F_C040, width: 4 },
    Reg { name: "M4MEMMAP", addr: 0x4004_3100, width: 4 },
];

/// Every script the driver ships. A family list of `*` matches any MCU;
/// a token may carry a trailing architecture tag which is also tried with
/// the tag stripped.
pub(crate) const SCRIPTS: &[ScriptDef] = &[
    // Map the boot region so that address 0 reads the vector table.
    ScriptDef {
        name: "memremap",
        mcus: "STM32F2xx,STM32F4,STM32F4xx,STM32F7xx",
        body: "SYSCFG_MEMRMP = 0\n",
    },
    ScriptDef {
        name: "memremap",
        mcus: "LPC8xx,LPC11xx,LPC12xx,LPC13xx,LPC15xx",
        body: "SYSMEMREMAP = 2\n",
    },
    ScriptDef {
        name: "memremap",
        mcus: "LPC17xx",
        body: "MEMMAP = 1\n",
    },
    ScriptDef {
        name: "memremap",
        mcus: "LPC43xx Cortex-M4",
        body: "M4MEMMAP = 0x1A000000\n",
    },
    // Route the SWO pin out of the device. Family-specific: pin muxing
    // plus the trace-output enable.
    ScriptDef {
        name: "swo-device",
        mcus: "STM32F1xx Cortex-M3,STM32F3xx",
        body: "\
            RCC_APB2ENR |= 0x01\n\
            AFIO_MAPR |= 0x02000000   # SWJ_CFG: JTAG off, SWD + SWO on\n\
            DBGMCU_CR |= 0x20         # TRACE_IOEN\n",
    },
    ScriptDef {
        name: "swo-device",
        mcus: "STM32F4,STM32F4xx,STM32F42x,STM32F7xx",
        body: "\
            RCC_AHB1ENR |= 0x02       # clock GPIOB for PB3/SWO\n\
            GPIOB_MODER ~= 0xC0\n\
            GPIOB_MODER |= 0x80       # PB3 to alternate function\n\
            GPIOB_OSPEEDR |= 0xC0     # high speed\n\
            GPIOB_AFRL ~= 0xF000      # AF0 = SWO\n\
            DBGMCU_CR |= 0x20         # TRACE_IOEN\n",
    },
    ScriptDef {
        name: "swo-device",
        mcus: "LPC8xx,LPC13xx,LPC15xx",
        body: "TRACECLKDIV = 1\n",
    },
    // Generic CoreSight bring-up: $0 = protocol (1 Manchester, 2 NRZ),
    // $1 = trace clock divisor.
    ScriptDef {
        name: "swo-trace",
        mcus: "*",
        body: "\
            ITM_LAR = 0xC5ACCE55      # unlock the ITM\n\
            SCB_DEMCR |= 0x01000000   # TRCENA\n\
            TPIU_CSPSR = 1\n\
            TPIU_ACPR = $1\n\
            TPIU_SPPR = $0\n\
            TPIU_FFCR = 0x100\n\
            DWT_CTRL = 0x400003FE\n\
            ITM_TCR = 0x0001000D\n",
    },
    // $0 = bit mask of stimulus channels to enable.
    ScriptDef {
        name: "swo-channels",
        mcus: "*",
        body: "ITM_TER = $0\n",
    },
    // Device-identification word, for families whose probe driver does
    // not report a part id itself.
    ScriptDef {
        name: "partid",
        mcus: "LPC8xx",
        body: "$ = 0x400483F8\n",
    },
    ScriptDef {
        name: "partid",
        mcus: "LPC11xx,LPC12xx,LPC13xx",
        body: "$ = 0x400483F4\n",
    },
];
