// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Scenarios that run a whole slow operation through the event loop.
