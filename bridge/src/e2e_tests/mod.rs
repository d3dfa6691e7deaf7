// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

mod harness;
